//! View and all-docs queries

use rusqlite::{params_from_iter, Connection};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::index::{decode_value, View};
use crate::engine::store::error::{Result, StoreError};
use crate::engine::store::storage::{self, RevisionStore};

/// Key range and paging options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_key: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_key: Option<Value>,

    /// Only rows whose key is one of these
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<Value>>,

    #[serde(default = "default_true")]
    pub inclusive_start: bool,

    #[serde(default = "default_true")]
    pub inclusive_end: bool,

    /// Walk keys from high to low; `start_key` is then the upper bound
    #[serde(default)]
    pub descending: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    #[serde(default)]
    pub skip: usize,

    #[serde(default)]
    pub include_docs: bool,

    #[serde(default)]
    pub update_seq: bool,
}

fn default_true() -> bool {
    true
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            start_key: None,
            end_key: None,
            keys: None,
            inclusive_start: true,
            inclusive_end: true,
            descending: false,
            limit: None,
            skip: 0,
            include_docs: false,
            update_seq: false,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_key(mut self, key: impl Into<Value>) -> Self {
        self.start_key = Some(key.into());
        self
    }

    pub fn end_key(mut self, key: impl Into<Value>) -> Self {
        self.end_key = Some(key.into());
        self
    }

    pub fn keys(mut self, keys: Vec<Value>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn inclusive_start(mut self, inclusive: bool) -> Self {
        self.inclusive_start = inclusive;
        self
    }

    pub fn inclusive_end(mut self, inclusive: bool) -> Self {
        self.inclusive_end = inclusive;
        self
    }

    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    pub fn include_docs(mut self, include: bool) -> Self {
        self.include_docs = include;
        self
    }

    pub fn update_seq(mut self, include: bool) -> Self {
        self.update_seq = include;
        self
    }

    /// `(lower, lower_inclusive, upper, upper_inclusive)` in ascending key terms
    fn bounds(&self) -> (Option<&Value>, bool, Option<&Value>, bool) {
        if self.descending {
            (
                self.end_key.as_ref(),
                self.inclusive_end,
                self.start_key.as_ref(),
                self.inclusive_start,
            )
        } else {
            (
                self.start_key.as_ref(),
                self.inclusive_start,
                self.end_key.as_ref(),
                self.inclusive_end,
            )
        }
    }

    fn sql_limit(&self) -> i64 {
        self.limit.map_or(-1, |n| n as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRow {
    pub id: String,
    pub key: Value,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub rows: Vec<QueryRow>,
    /// Rows in the whole index, regardless of range or paging
    pub total_rows: usize,
    pub offset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_seq: Option<i64>,
}

/// Append range predicates on `column` to `sql`
fn push_bounds(
    sql: &mut String,
    args: &mut Vec<SqlValue>,
    column: &str,
    collate: &str,
    options: &QueryOptions,
    encode: impl Fn(&Value) -> Result<String>,
) -> Result<()> {
    let (lower, lower_inclusive, upper, upper_inclusive) = options.bounds();
    if let Some(lower) = lower {
        let op = if lower_inclusive { ">=" } else { ">" };
        sql.push_str(&format!(" AND {} {} ?{} {}", column, op, args.len() + 1, collate));
        args.push(SqlValue::Text(encode(lower)?));
    }
    if let Some(upper) = upper {
        let op = if upper_inclusive { "<=" } else { "<" };
        sql.push_str(&format!(" AND {} {} ?{} {}", column, op, args.len() + 1, collate));
        args.push(SqlValue::Text(encode(upper)?));
    }
    if let Some(keys) = &options.keys {
        let placeholders: Vec<String> = keys
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", args.len() + i + 1))
            .collect();
        sql.push_str(&format!(" AND {} IN ({})", column, placeholders.join(", ")));
        for key in keys {
            args.push(SqlValue::Text(encode(key)?));
        }
    }
    Ok(())
}

impl View<'_> {
    /// Update the index, then return the rows in the requested key range
    pub fn query(&self, options: &QueryOptions) -> Result<QueryResult> {
        let update = self.update_index()?;
        self.store
            .db
            .read(|conn| self.read_rows(conn, options, update.last_sequence))
    }

    fn read_rows(&self, conn: &Connection, options: &QueryOptions, indexed: i64) -> Result<QueryResult> {
        let collation = self.collation.sql_name();
        let direction = if options.descending { "DESC" } else { "" };

        let mut sql = String::from(
            "SELECT key, value, docid, revs.sequence, revid, revs.json, revs.deleted
             FROM maps, revs, docs
             WHERE maps.view_id = ?1 AND revs.sequence = maps.sequence AND docs.doc_id = revs.doc_id",
        );
        let mut args = vec![SqlValue::Integer(self.id)];
        push_bounds(
            &mut sql,
            &mut args,
            "key",
            &format!("COLLATE {}", collation),
            options,
            |key| Ok(serde_json::to_string(key)?),
        )?;
        sql.push_str(&format!(
            " ORDER BY key COLLATE {} {}, docid {} LIMIT ?{} OFFSET ?{}",
            collation,
            direction,
            direction,
            args.len() + 1,
            args.len() + 2
        ));
        args.push(SqlValue::Integer(options.sql_limit()));
        args.push(SqlValue::Integer(options.skip as i64));

        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<Vec<u8>>>(5)?,
                    row.get::<_, bool>(6)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut rows = Vec::with_capacity(raw.len());
        for (key, value, doc_id, sequence, rev_id, json, deleted) in raw {
            let doc = match (options.include_docs, json) {
                (true, Some(json)) => Some(storage::expanded_properties(
                    conn, &doc_id, &rev_id, sequence, deleted, &json,
                )?),
                _ => None,
            };
            rows.push(QueryRow {
                id: doc_id,
                key: serde_json::from_str(&key)?,
                value: decode_value(value.as_deref())?,
                doc,
            });
        }

        let total_rows: i64 = conn.query_row(
            "SELECT COUNT(*) FROM maps WHERE view_id = ?1",
            [self.id],
            |row| row.get(0),
        )?;

        Ok(QueryResult {
            rows,
            total_rows: total_rows as usize,
            offset: options.skip,
            update_seq: options.update_seq.then_some(indexed),
        })
    }
}

impl RevisionStore {
    /// The winning revision of every live document, ordered by document id.
    /// Keys in `options` are document ids and must be strings.
    pub fn all_docs(&self, options: &QueryOptions) -> Result<QueryResult> {
        self.db.read(|conn| all_docs(conn, options))
    }
}

fn all_docs(conn: &Connection, options: &QueryOptions) -> Result<QueryResult> {
    let direction = if options.descending { "DESC" } else { "" };

    let mut sql = String::from(
        "SELECT docid, revs.sequence, revid, revs.json FROM revs, docs
         WHERE current = 1 AND deleted = 0 AND revs.doc_id = docs.doc_id",
    );
    let mut args = Vec::new();
    push_bounds(&mut sql, &mut args, "docid", "", options, |key| match key {
        Value::String(s) => Ok(s.clone()),
        other => Err(StoreError::bad_request(format!(
            "document id keys must be strings, got {}",
            other
        ))),
    })?;
    sql.push_str(&format!(" ORDER BY docid {}, revid DESC", direction));

    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map(params_from_iter(args.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<Vec<u8>>>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut winners = raw;
    // Highest revid comes first within each document
    winners.dedup_by(|later, earlier| later.0 == earlier.0);
    let total_rows = storage::document_count(conn)?;

    let mut rows = Vec::new();
    for (doc_id, sequence, rev_id, json) in winners
        .into_iter()
        .skip(options.skip)
        .take(options.limit.unwrap_or(usize::MAX))
    {
        let doc = match (options.include_docs, json) {
            (true, Some(json)) => Some(storage::expanded_properties(
                conn, &doc_id, &rev_id, sequence, false, &json,
            )?),
            _ => None,
        };
        rows.push(QueryRow {
            key: Value::String(doc_id.clone()),
            id: doc_id,
            value: json!({ "rev": rev_id }),
            doc,
        });
    }

    let update_seq = if options.update_seq {
        Some(storage::last_sequence(conn)?)
    } else {
        None
    };
    Ok(QueryResult {
        rows,
        total_rows: total_rows as usize,
        offset: options.skip,
        update_seq,
    })
}
