//! Change notifications and the paged change feed

use std::collections::VecDeque;
use std::sync::mpsc::Sender;

use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::Result;
use super::revision::RevId;
use crate::engine::database::Database;

/// A revision that became a current leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub doc_id: String,
    pub rev_id: RevId,
    pub sequence: i64,
    pub deleted: bool,
    /// Replication source tag, for revisions ingested through `force_insert`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Receives changes after the transaction that made them commits
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, change: &Change);
}

impl<F> ChangeListener for F
where
    F: Fn(&Change) + Send + Sync,
{
    fn on_change(&self, change: &Change) {
        self(change)
    }
}

impl ChangeListener for Sender<Change> {
    fn on_change(&self, change: &Change) {
        if self.send(change.clone()).is_err() {
            debug!(sequence = change.sequence, "change receiver dropped");
        }
    }
}

/// Current leaves with `sequence > since`, in sequence order.
///
/// Rows are fetched a page at a time, each page on a fresh pooled connection,
/// so the feed can be held across writes. `last_sequence()` is the cursor to
/// restart from.
pub struct ChangesFeed<'a> {
    db: &'a Database,
    cursor: i64,
    remaining: Option<usize>,
    page_size: usize,
    buffer: VecDeque<Change>,
    exhausted: bool,
}

impl<'a> ChangesFeed<'a> {
    pub(crate) fn new(db: &'a Database, since: i64, limit: Option<usize>, page_size: usize) -> Self {
        Self {
            db,
            cursor: since,
            remaining: limit,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Sequence of the last change yielded (or the starting point)
    pub fn last_sequence(&self) -> i64 {
        self.cursor
    }

    fn fetch_page(&mut self) -> Result<()> {
        let page = match self.remaining {
            Some(remaining) => remaining.min(self.page_size),
            None => self.page_size,
        };
        // Continue after whatever is already buffered
        let after = self.buffer.back().map_or(self.cursor, |c| c.sequence);

        let rows = self.db.read(|conn| -> Result<Vec<(i64, String, String, bool)>> {
            let mut stmt = conn.prepare_cached(
                "SELECT sequence, docid, revid, deleted FROM revs, docs
                 WHERE sequence > ?1 AND current = 1 AND revs.doc_id = docs.doc_id
                 ORDER BY sequence LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![after, page as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        if rows.len() < page {
            self.exhausted = true;
        }
        for (sequence, doc_id, rev_id, deleted) in rows {
            self.buffer.push_back(Change {
                doc_id,
                rev_id: rev_id.parse()?,
                sequence,
                deleted,
                source: None,
            });
        }
        Ok(())
    }
}

impl Iterator for ChangesFeed<'_> {
    type Item = Result<Change>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        if self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }

        let change = self.buffer.pop_front()?;
        self.cursor = change.sequence;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(Ok(change))
    }
}
