//! Revision Store
//!
//! Documents are trees of immutable revisions. Every write appends a revision
//! and moves the document's `current` leaf marker; conflicting branches stay
//! side by side until a caller resolves them with a new revision.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::attachments::{self, Attachment};
use super::blob::{BlobStore, FileBlobStore, MemoryBlobStore};
use super::body;
use super::changes::{Change, ChangeListener, ChangesFeed};
use super::error::{Result, StoreError};
use super::revision::{RevId, Revision, RevisionList};
use super::validation::{ValidationContext, Validator};
use crate::engine::config::{ConfigError, StoreConfig};
use crate::engine::database::{Database, WriteTxn};
use crate::engine::view::MapFn;

/// Columns read by `revision_from_row`, in order
pub(crate) const REVISION_COLUMNS: &str =
    "revs.sequence, docs.docid, revs.revid, COALESCE(revs.parent, 0), revs.current, revs.deleted, revs.json";

/// What `compact` removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionSummary {
    pub bodies_pruned: usize,
    pub attachments_removed: usize,
    pub blobs_deleted: usize,
}

pub struct RevisionStore {
    pub(crate) db: Database,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) maps: RwLock<HashMap<String, Arc<MapFn>>>,
    /// Changes of the open write transaction, delivered after it commits
    pending: Mutex<Vec<Change>>,
    listeners: Vec<Arc<dyn ChangeListener>>,
    validators: Vec<Arc<dyn Validator>>,
    config: StoreConfig,
}

impl RevisionStore {
    pub fn open(config: StoreConfig) -> Result<Self> {
        let db = match &config.database.path {
            Some(path) => Database::new(path, &config.database)?,
            None => Database::in_memory()?,
        };
        let blobs: Arc<dyn BlobStore> = match &config.attachments.path {
            Some(path) => Arc::new(FileBlobStore::open(path)?),
            None => Arc::new(MemoryBlobStore::new()),
        };
        info!(path = ?config.database.path, "opened revision store");

        Ok(Self {
            db,
            blobs,
            maps: RwLock::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            listeners: Vec::new(),
            validators: Vec::new(),
            config,
        })
    }

    /// Open the store described by `revdb.config.json` in `store_dir`,
    /// creating a default configuration there if none exists
    pub fn open_dir(store_dir: &Path) -> Result<Self> {
        let config = match StoreConfig::load(store_dir) {
            Ok(config) => config,
            Err(ConfigError::NotFound(_)) => {
                let config = StoreConfig::default_for_dir(store_dir);
                config
                    .save(store_dir)
                    .map_err(|e| StoreError::Internal(e.to_string()))?;
                config
            }
            Err(e) => return Err(StoreError::Internal(e.to_string())),
        };
        Self::open(config)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(StoreConfig::in_memory())
    }

    pub fn with_listener(mut self, listener: impl ChangeListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn blob_store(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    /// Run several mutations as one atomic unit.
    ///
    /// Change notifications queued by the mutations are delivered once the
    /// transaction commits, and dropped if it rolls back. Called from inside
    /// another transaction on the same thread, it joins that one.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StoreTxn<'_>) -> Result<T>,
    {
        let mut outermost = false;
        let mut pending = Vec::new();
        let value = self.db.write(|write| -> Result<T> {
            outermost = write.depth() == 1;
            if outermost {
                // Left behind if an earlier transaction panicked
                self.pending.lock().clear();
            }
            let result = f(&StoreTxn { store: self, write });
            // Taken while the writer is still held, whatever the outcome
            if outermost {
                pending = std::mem::take(&mut *self.pending.lock());
            }
            result
        })?;
        if !outermost {
            return Ok(value);
        }

        for change in &pending {
            for listener in &self.listeners {
                listener.on_change(change);
            }
        }
        Ok(value)
    }

    /// Create a revision. See [`StoreTxn::put_revision`].
    pub fn put_revision(
        &self,
        doc_id: Option<&str>,
        prev_rev_id: Option<&str>,
        body: Value,
        deleted: bool,
    ) -> Result<Revision> {
        self.transaction(|txn| txn.put_revision(doc_id, prev_rev_id, body, deleted))
    }

    /// A revision of a document with its properties expanded. Without
    /// `rev_id`, the winning revision; NotFound if the document is deleted.
    pub fn get_document(&self, doc_id: &str, rev_id: Option<&RevId>) -> Result<Revision> {
        self.db.read(|conn| get_document(conn, doc_id, rev_id))
    }

    /// Ancestors of `revision`, itself first, back to its root
    pub fn get_revision_history(&self, revision: &Revision) -> Result<Vec<Revision>> {
        self.db
            .read(|conn| revision_history(conn, &revision.doc_id, &revision.rev_id))
    }

    pub fn changes_since(&self, since: i64, limit: Option<usize>) -> ChangesFeed<'_> {
        ChangesFeed::new(&self.db, since, limit, self.config.changes.page_size)
    }

    /// Documents whose winning revision is not a tombstone
    pub fn document_count(&self) -> Result<u64> {
        self.db.read(document_count)
    }

    pub fn last_sequence(&self) -> Result<i64> {
        self.db.read(last_sequence)
    }

    /// Every stored revision of a document, newest first, without bodies
    pub fn all_revisions_of(&self, doc_id: &str, only_current: bool) -> Result<RevisionList> {
        self.db.read(|conn| revisions_of(conn, doc_id, only_current))
    }

    /// Live leaves other than the winner, highest first
    pub fn conflicting_revisions(&self, doc_id: &str) -> Result<Vec<RevId>> {
        let leaves = self.all_revisions_of(doc_id, true)?;
        let winner = leaves.winner().map(|w| w.sequence);
        let mut conflicts: Vec<RevId> = leaves
            .iter()
            .filter(|r| !r.deleted && Some(r.sequence) != winner)
            .map(|r| r.rev_id.clone())
            .collect();
        conflicts.sort_by(|a, b| b.cmp(a));
        Ok(conflicts)
    }

    pub fn attachment(&self, doc_id: &str, rev_id: &RevId, filename: &str) -> Result<Attachment> {
        self.db.read(|conn| {
            let sequence = sequence_of(conn, doc_id, rev_id)?
                .ok_or_else(|| StoreError::not_found(format!("{} {}", doc_id, rev_id)))?;
            attachments::load(conn, self.blobs.as_ref(), sequence, filename)
        })
    }

    /// Discard bodies and attachments of non-current revisions, delete blobs
    /// nothing references any more, then VACUUM
    pub fn compact(&self) -> Result<CompactionSummary> {
        let summary = self.db.write(|txn| -> Result<CompactionSummary> {
            let bodies_pruned = txn.execute(
                "UPDATE revs SET json = NULL WHERE current = 0 AND json IS NOT NULL",
                [],
            )?;
            let attachments_removed = txn.execute(
                "DELETE FROM attachments WHERE sequence IN (SELECT sequence FROM revs WHERE current = 0)",
                [],
            )?;
            let keep = attachments::referenced_keys(txn)?;
            let blobs_deleted = self.blobs.retain(&keep)?;
            Ok(CompactionSummary {
                bodies_pruned,
                attachments_removed,
                blobs_deleted,
            })
        })?;
        self.db.vacuum()?;

        info!(
            bodies = summary.bodies_pruned,
            attachments = summary.attachments_removed,
            blobs = summary.blobs_deleted,
            "compacted revision store"
        );
        Ok(summary)
    }
}

/// Handle passed to [`RevisionStore::transaction`]
pub struct StoreTxn<'a> {
    pub(crate) store: &'a RevisionStore,
    pub(crate) write: &'a WriteTxn<'a>,
}

impl<'a> StoreTxn<'a> {
    pub(crate) fn conn(&self) -> &Connection {
        self.write.conn()
    }

    pub(crate) fn queue(&self, change: Change) {
        self.store.pending.lock().push(change);
    }

    /// Run `f` as a nested scope; if it fails, the enclosing transaction rolls
    /// back even if the error is handled
    pub fn nested<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.write.nested(f)
    }

    /// Create a revision.
    ///
    /// - no `doc_id`, no parent: a new document with a generated id
    /// - `doc_id`, no parent: a new document, or a resurrection starting a new
    ///   root if its leaves are all tombstones; Conflict if one is live
    /// - `doc_id` and parent: the parent must be a current leaf; Conflict if
    ///   it is not but the document has a live leaf, NotFound otherwise
    pub fn put_revision(
        &self,
        doc_id: Option<&str>,
        prev_rev_id: Option<&str>,
        body: Value,
        deleted: bool,
    ) -> Result<Revision> {
        self.nested(|| self.insert_revision(doc_id, prev_rev_id, body, deleted))
    }

    fn insert_revision(
        &self,
        doc_id: Option<&str>,
        prev_rev_id: Option<&str>,
        body: Value,
        deleted: bool,
    ) -> Result<Revision> {
        if deleted && prev_rev_id.is_none() {
            return Err(StoreError::bad_request("deleting requires a parent revision"));
        }
        if doc_id == Some("") {
            return Err(StoreError::bad_request("empty document id"));
        }
        let prev_rev_id = prev_rev_id.map(str::parse::<RevId>).transpose()?;
        let stripped = body::strip(body_object(body)?)?;
        let conn = self.conn();

        let (doc_id, doc_key, parent, replaced) = match (doc_id, prev_rev_id.as_ref()) {
            (None, Some(_)) => {
                return Err(StoreError::bad_request("parent revision given without a document id"))
            }
            (Some(doc_id), Some(prev)) => {
                let doc_key = lookup_doc_key(conn, doc_id)?
                    .ok_or_else(|| StoreError::not_found(doc_id.to_string()))?;
                let leaves = current_leaves(conn, doc_key)?;
                match leaves.iter().find(|r| &r.rev_id == prev) {
                    Some(parent) => (doc_id.to_string(), doc_key, Some(parent.clone()), Vec::new()),
                    None if leaves.iter().any(|r| !r.deleted) => {
                        return Err(StoreError::conflict(format!("{} is not a leaf of {}", prev, doc_id)))
                    }
                    None => return Err(StoreError::not_found(format!("{} {}", doc_id, prev))),
                }
            }
            (Some(doc_id), None) => {
                let doc_key = ensure_doc_key(conn, doc_id)?;
                let leaves = current_leaves(conn, doc_key)?;
                if leaves.iter().any(|r| !r.deleted) {
                    return Err(StoreError::conflict(format!("{} already exists", doc_id)));
                }
                // The tombstones stop being leaves; the new revision is a root
                let tombstones: Vec<i64> = leaves.iter().map(|r| r.sequence).collect();
                (doc_id.to_string(), doc_key, None, tombstones)
            }
            (None, None) => {
                let doc_id = Uuid::new_v4().simple().to_string();
                let doc_key = ensure_doc_key(conn, &doc_id)?;
                (doc_id, doc_key, None, Vec::new())
            }
        };

        let rev_id = RevId::next(parent.as_ref().map(|p| &p.rev_id));
        let parent_sequence = parent.as_ref().map(|p| p.sequence);
        let rows = attachments::prepare(
            conn,
            self.store.blobs.as_ref(),
            stripped.attachments.as_ref(),
            parent_sequence,
        )?;

        if !self.store.validators.is_empty() {
            let candidate = Revision {
                doc_id: doc_id.clone(),
                rev_id: rev_id.clone(),
                sequence: 0,
                parent_sequence: parent_sequence.unwrap_or(0),
                current: true,
                deleted,
                properties: Some(body::splice(
                    stripped.properties.clone(),
                    &doc_id,
                    &rev_id.to_string(),
                    deleted,
                    stripped.attachments.clone(),
                )),
            };
            let current = match &parent {
                Some(parent) => Some(load_revision(conn, parent.sequence)?),
                None => None,
            };
            self.validate(&candidate, current)?;
        }

        for demoted in parent_sequence.iter().chain(&replaced) {
            conn.execute("UPDATE revs SET current = 0 WHERE sequence = ?1", [demoted])?;
        }
        let json = body::encode(&stripped.properties)?;
        let sequence = insert_rev(conn, doc_key, &rev_id, parent_sequence, true, deleted, Some(&json))?;
        attachments::insert(conn, sequence, &rows)?;

        debug!(doc_id = %doc_id, rev_id = %rev_id, sequence, deleted, "put revision");
        self.queue(Change {
            doc_id: doc_id.clone(),
            rev_id: rev_id.clone(),
            sequence,
            deleted,
            source: None,
        });

        let attachment_stubs = attachments::stubs(conn, sequence)?;
        Ok(Revision {
            properties: Some(body::splice(
                stripped.properties,
                &doc_id,
                &rev_id.to_string(),
                deleted,
                attachment_stubs,
            )),
            doc_id,
            rev_id,
            sequence,
            parent_sequence: parent_sequence.unwrap_or(0),
            current: true,
            deleted,
        })
    }

    pub(crate) fn validate(&self, candidate: &Revision, current: Option<Revision>) -> Result<()> {
        let context = ValidationContext {
            current_revision: current,
        };
        for validator in &self.store.validators {
            validator
                .validate(candidate, &context)
                .map_err(StoreError::Forbidden)?;
        }
        Ok(())
    }

    pub fn get_document(&self, doc_id: &str, rev_id: Option<&RevId>) -> Result<Revision> {
        get_document(self.conn(), doc_id, rev_id)
    }
}

pub(crate) fn body_object(body: Value) -> Result<Map<String, Value>> {
    match body {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(StoreError::bad_request(format!(
            "document body must be an object, got {}",
            other
        ))),
    }
}

pub(crate) fn lookup_doc_key(conn: &Connection, doc_id: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row("SELECT doc_id FROM docs WHERE docid = ?1", [doc_id], |row| row.get(0))
        .optional()?)
}

pub(crate) fn ensure_doc_key(conn: &Connection, doc_id: &str) -> Result<i64> {
    if let Some(key) = lookup_doc_key(conn, doc_id)? {
        return Ok(key);
    }
    conn.execute("INSERT INTO docs (docid) VALUES (?1)", [doc_id])?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn insert_rev(
    conn: &Connection,
    doc_key: i64,
    rev_id: &RevId,
    parent_sequence: Option<i64>,
    current: bool,
    deleted: bool,
    json: Option<&[u8]>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO revs (doc_id, revid, parent, current, deleted, json) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![doc_key, rev_id.to_string(), parent_sequence, current, deleted, json],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn document_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT doc_id) FROM revs WHERE current = 1 AND deleted = 0",
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub(crate) fn last_sequence(conn: &Connection) -> Result<i64> {
    let last: Option<i64> = conn.query_row("SELECT MAX(sequence) FROM revs", [], |row| row.get(0))?;
    Ok(last.unwrap_or(0))
}

/// Map a row selected with `REVISION_COLUMNS`. The body is decoded but not
/// expanded.
pub(crate) fn revision_from_row(row: &Row<'_>) -> rusqlite::Result<(Revision, Option<Vec<u8>>)> {
    let rev_id: String = row.get(2)?;
    let rev_id = rev_id.parse::<RevId>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok((
        Revision {
            doc_id: row.get(1)?,
            rev_id,
            sequence: row.get(0)?,
            parent_sequence: row.get(3)?,
            current: row.get(4)?,
            deleted: row.get(5)?,
            properties: None,
        },
        row.get(6)?,
    ))
}

/// Fill in a revision's expanded properties from its stored body
pub(crate) fn expand(conn: &Connection, revision: &mut Revision, json: Option<&[u8]>) -> Result<()> {
    if let Some(json) = json {
        revision.properties = Some(expanded_properties(
            conn,
            &revision.doc_id,
            &revision.rev_id.to_string(),
            revision.sequence,
            revision.deleted,
            json,
        )?);
    }
    Ok(())
}

/// A stored body with `_id`, `_rev`, `_deleted` and `_attachments` spliced in
pub(crate) fn expanded_properties(
    conn: &Connection,
    doc_id: &str,
    rev_id: &str,
    sequence: i64,
    deleted: bool,
    json: &[u8],
) -> Result<Map<String, Value>> {
    let stored = body::decode(json)?;
    let stubs = attachments::stubs(conn, sequence)?;
    Ok(body::splice(stored, doc_id, rev_id, deleted, stubs))
}

pub(crate) fn load_revision(conn: &Connection, sequence: i64) -> Result<Revision> {
    let sql = format!(
        "SELECT {} FROM revs, docs WHERE revs.sequence = ?1 AND revs.doc_id = docs.doc_id",
        REVISION_COLUMNS
    );
    let (mut revision, json) = conn
        .query_row(&sql, [sequence], revision_from_row)
        .optional()?
        .ok_or_else(|| StoreError::not_found(format!("sequence {}", sequence)))?;
    expand(conn, &mut revision, json.as_deref())?;
    Ok(revision)
}

fn get_document(conn: &Connection, doc_id: &str, rev_id: Option<&RevId>) -> Result<Revision> {
    let doc_key =
        lookup_doc_key(conn, doc_id)?.ok_or_else(|| StoreError::not_found(doc_id.to_string()))?;

    let sequence = match rev_id {
        Some(rev_id) => sequence_of(conn, doc_id, rev_id)?
            .ok_or_else(|| StoreError::not_found(format!("{} {}", doc_id, rev_id)))?,
        None => {
            let winner: Option<i64> = conn
                .query_row(
                    "SELECT sequence FROM revs WHERE doc_id = ?1 AND current = 1 AND deleted = 0
                     ORDER BY revid DESC LIMIT 1",
                    [doc_key],
                    |row| row.get(0),
                )
                .optional()?;
            winner.ok_or_else(|| StoreError::not_found(format!("{} is deleted", doc_id)))?
        }
    };
    load_revision(conn, sequence)
}

pub(crate) fn sequence_of(conn: &Connection, doc_id: &str, rev_id: &RevId) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT sequence FROM revs, docs
             WHERE docs.docid = ?1 AND revs.doc_id = docs.doc_id AND revid = ?2",
            params![doc_id, rev_id.to_string()],
            |row| row.get(0),
        )
        .optional()?)
}

fn current_leaves(conn: &Connection, doc_key: i64) -> Result<Vec<Revision>> {
    let sql = format!(
        "SELECT {} FROM revs, docs
         WHERE revs.doc_id = ?1 AND current = 1 AND revs.doc_id = docs.doc_id
         ORDER BY revid DESC",
        REVISION_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let leaves = stmt
        .query_map([doc_key], |row| revision_from_row(row).map(|(r, _)| r))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(leaves)
}

pub(crate) fn revisions_of(conn: &Connection, doc_id: &str, only_current: bool) -> Result<RevisionList> {
    let sql = format!(
        "SELECT {} FROM revs, docs
         WHERE docs.docid = ?1 AND revs.doc_id = docs.doc_id {}
         ORDER BY revs.sequence DESC",
        REVISION_COLUMNS,
        if only_current { "AND current = 1" } else { "" }
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let revisions = stmt
        .query_map([doc_id], |row| revision_from_row(row).map(|(r, _)| r))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(RevisionList::new(revisions))
}

fn revision_history(conn: &Connection, doc_id: &str, rev_id: &RevId) -> Result<Vec<Revision>> {
    let revisions = revisions_of(conn, doc_id, false)?;
    let start = revisions
        .find(doc_id, rev_id)
        .map(|r| r.sequence)
        .ok_or_else(|| StoreError::not_found(format!("{} {}", doc_id, rev_id)))?;

    let by_sequence: HashMap<i64, Revision> = revisions
        .into_iter()
        .map(|r| (r.sequence, r))
        .collect();

    let mut history = Vec::new();
    let mut next = start;
    while next != 0 {
        let Some(revision) = by_sequence.get(&next) else {
            break;
        };
        history.push(revision.clone());
        next = revision.parent_sequence;
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_and_get() {
        let store = RevisionStore::in_memory().unwrap();
        let rev = store
            .put_revision(Some("a"), None, json!({"x": 1, "_id": "ignored"}), false)
            .unwrap();
        assert_eq!(rev.generation(), 1);
        assert_eq!(rev.parent_sequence, 0);

        let doc = store.get_document("a", None).unwrap();
        assert_eq!(doc.rev_id, rev.rev_id);
        assert_eq!(doc.get("x"), Some(&json!(1)));
        assert_eq!(doc.get("_id"), Some(&json!("a")));
    }

    #[test]
    fn test_generated_doc_id() {
        let store = RevisionStore::in_memory().unwrap();
        let rev = store.put_revision(None, None, json!({}), false).unwrap();
        assert!(!rev.doc_id.is_empty());
        assert_eq!(store.document_count().unwrap(), 1);
    }

    #[test]
    fn test_bad_requests() {
        let store = RevisionStore::in_memory().unwrap();
        let err = store.put_revision(Some("a"), None, json!({}), true).unwrap_err();
        assert!(matches!(err, StoreError::BadRequest(_)));
        let err = store.put_revision(None, Some("1-a"), json!({}), false).unwrap_err();
        assert!(matches!(err, StoreError::BadRequest(_)));
        let err = store.put_revision(Some("a"), Some("nope"), json!({}), false).unwrap_err();
        assert!(matches!(err, StoreError::BadRequest(_)));
        let err = store.put_revision(Some("a"), None, json!([1]), false).unwrap_err();
        assert!(matches!(err, StoreError::BadRequest(_)));
        assert_eq!(store.last_sequence().unwrap(), 0);
    }

    #[test]
    fn test_missing_parent_is_not_found() {
        let store = RevisionStore::in_memory().unwrap();
        let err = store.put_revision(Some("a"), Some("1-a"), json!({}), false).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_resurrection_starts_new_root() {
        let store = RevisionStore::in_memory().unwrap();
        let r1 = store.put_revision(Some("a"), None, json!({}), false).unwrap();
        let r2 = store
            .put_revision(Some("a"), Some(&r1.rev_id.to_string()), json!({}), true)
            .unwrap();
        assert!(store.get_document("a", None).is_err());

        let r3 = store.put_revision(Some("a"), None, json!({"back": true}), false).unwrap();
        assert_eq!(r3.generation(), 1);
        assert_eq!(r3.parent_sequence, 0);
        assert_eq!(store.get_revision_history(&r3).unwrap().len(), 1);

        let leaves = store.all_revisions_of("a", true).unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves.winner().unwrap().rev_id, r3.rev_id);
        let tombstone = store.get_document("a", Some(&r2.rev_id)).unwrap();
        assert!(!tombstone.current);
        assert_eq!(store.get_document("a", None).unwrap().rev_id, r3.rev_id);
    }

    #[test]
    fn test_history_iterative() {
        let store = RevisionStore::in_memory().unwrap();
        let mut rev = store.put_revision(Some("a"), None, json!({"n": 0}), false).unwrap();
        for n in 1..12 {
            rev = store
                .put_revision(Some("a"), Some(&rev.rev_id.to_string()), json!({"n": n}), false)
                .unwrap();
        }
        let history = store.get_revision_history(&rev).unwrap();
        assert_eq!(history.len(), 12);
        let generations: Vec<u64> = history.iter().map(|r| r.generation()).collect();
        assert_eq!(generations, (1..=12).rev().collect::<Vec<_>>());
    }
}
