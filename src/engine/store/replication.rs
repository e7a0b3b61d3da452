//! Replication support: ingesting foreign revision histories, revs-diff and
//! per-remote checkpoints

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use super::attachments;
use super::body;
use super::changes::Change;
use super::error::{Result, Status, StoreError};
use super::revision::{RevId, Revision};
use super::storage::{self, RevisionStore, StoreTxn};

impl RevisionStore {
    /// Insert a revision received from another replica. See
    /// [`StoreTxn::force_insert`].
    pub fn force_insert(
        &self,
        doc_id: &str,
        history: &[RevId],
        body: Value,
        deleted: bool,
        source: Option<&str>,
    ) -> Result<Status> {
        self.transaction(|txn| txn.force_insert(doc_id, history, body, deleted, source))
    }

    /// The subset of `revisions` not stored locally, in input order
    pub fn missing_revisions(&self, revisions: &[(String, RevId)]) -> Result<Vec<(String, RevId)>> {
        let known = self.db.read(|conn| -> Result<HashMap<&str, Vec<RevId>>> {
            let mut known: HashMap<&str, Vec<RevId>> = HashMap::new();
            for (doc_id, _) in revisions {
                if !known.contains_key(doc_id.as_str()) {
                    let stored = storage::revisions_of(conn, doc_id, false)?
                        .into_iter()
                        .map(|r| r.rev_id)
                        .collect();
                    known.insert(doc_id, stored);
                }
            }
            Ok(known)
        })?;

        Ok(revisions
            .iter()
            .filter(|(doc_id, rev_id)| {
                !known
                    .get(doc_id.as_str())
                    .is_some_and(|stored| stored.contains(rev_id))
            })
            .cloned()
            .collect())
    }

    /// Checkpoint stored for a remote and direction, if any
    pub fn last_sequence_with_remote(&self, remote: &str, push: bool) -> Result<Option<String>> {
        self.db.read(|conn| -> Result<Option<String>> {
            Ok(conn
                .query_row(
                    "SELECT last_sequence FROM replicators WHERE remote = ?1 AND push = ?2",
                    params![remote, push],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn set_last_sequence(&self, last_sequence: &str, remote: &str, push: bool) -> Result<()> {
        self.db.write(|txn| -> Result<()> {
            txn.execute(
                "INSERT OR REPLACE INTO replicators (remote, push, last_sequence) VALUES (?1, ?2, ?3)",
                params![remote, push, last_sequence],
            )?;
            Ok(())
        })
    }
}

impl StoreTxn<'_> {
    /// Insert a revision along with its ancestry.
    ///
    /// `history` runs oldest to newest and ends with the revision itself;
    /// each entry's generation is one more than the previous. Ancestors not
    /// stored locally are inserted as bodiless stubs. Existing leaves on other
    /// branches are left alone, so a divergent history becomes a conflict.
    /// Returns `Ok` if the revision was already known, `Created` otherwise.
    pub fn force_insert(
        &self,
        doc_id: &str,
        history: &[RevId],
        body: Value,
        deleted: bool,
        source: Option<&str>,
    ) -> Result<Status> {
        self.nested(|| self.insert_history(doc_id, history, body, deleted, source))
    }

    fn insert_history(
        &self,
        doc_id: &str,
        history: &[RevId],
        body: Value,
        deleted: bool,
        source: Option<&str>,
    ) -> Result<Status> {
        if doc_id.is_empty() {
            return Err(StoreError::bad_request("empty document id"));
        }
        let Some(newest) = history.last() else {
            return Err(StoreError::bad_request("empty revision history"));
        };
        if let Some(pair) = history
            .windows(2)
            .find(|pair| pair[1].generation() != pair[0].generation() + 1)
        {
            return Err(StoreError::bad_request(format!(
                "revision history is not contiguous at {} -> {}",
                pair[0], pair[1]
            )));
        }
        let stripped = body::strip(storage::body_object(body)?)?;

        let conn = self.conn();
        let doc_key = storage::ensure_doc_key(conn, doc_id)?;
        let stored: HashMap<RevId, i64> = storage::revisions_of(conn, doc_id, false)?
            .into_iter()
            .map(|r| (r.rev_id, r.sequence))
            .collect();

        if stored.contains_key(newest) {
            debug!(doc_id, rev_id = %newest, "revision already present");
            return Ok(Status::Ok);
        }

        // Graft onto the newest ancestor we already have
        let known = history.iter().rposition(|id| stored.contains_key(id));
        let local_parent = known.and_then(|i| stored.get(&history[i]).copied());
        let start = known.map_or(0, |i| i + 1);
        let (ancestors, _) = history[start..].split_at(history.len() - start - 1);

        let rows = attachments::prepare(
            conn,
            self.store.blobs.as_ref(),
            stripped.attachments.as_ref(),
            local_parent,
        )?;

        let candidate = Revision {
            doc_id: doc_id.to_string(),
            rev_id: newest.clone(),
            sequence: 0,
            parent_sequence: 0,
            current: true,
            deleted,
            properties: Some(body::splice(
                stripped.properties.clone(),
                doc_id,
                &newest.to_string(),
                deleted,
                stripped.attachments.clone(),
            )),
        };
        let current = match local_parent {
            Some(sequence) => Some(storage::load_revision(conn, sequence)?),
            None => None,
        };
        self.validate(&candidate, current)?;

        let mut parent = local_parent;
        for ancestor in ancestors {
            parent = Some(storage::insert_rev(conn, doc_key, ancestor, parent, false, false, None)?);
        }

        if let Some(local_parent) = local_parent {
            conn.execute("UPDATE revs SET current = 0 WHERE sequence = ?1", [local_parent])?;
        }
        let json = body::encode(&stripped.properties)?;
        let sequence = storage::insert_rev(conn, doc_key, newest, parent, true, deleted, Some(&json))?;
        attachments::insert(conn, sequence, &rows)?;

        debug!(
            doc_id,
            rev_id = %newest,
            sequence,
            stubs = ancestors.len(),
            source = source.unwrap_or(""),
            "force-inserted revision"
        );
        self.queue(Change {
            doc_id: doc_id.to_string(),
            rev_id: newest.clone(),
            sequence,
            deleted,
            source: source.map(str::to_string),
        });
        Ok(Status::Created)
    }
}
