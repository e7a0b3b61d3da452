//! View definitions and incremental index maintenance

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::engine::collate::Collation;
use crate::engine::store::error::{Result, StoreError};
use crate::engine::store::storage::{self, RevisionStore};

/// A map function: inspects an expanded document and emits key/value rows
pub type MapFn = dyn Fn(&Map<String, Value>, &mut Emitter) + Send + Sync;

/// Documents with this id prefix hold view definitions and are never indexed
const DESIGN_PREFIX: &str = "_design/";

/// Collects the rows a map function emits for one document
#[derive(Debug, Default)]
pub struct Emitter {
    rows: Vec<(Value, Value)>,
}

impl Emitter {
    pub fn emit(&mut self, key: impl Into<Value>, value: impl Into<Value>) {
        self.rows.push((key.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Result of one `update_index` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexUpdate {
    pub removed: usize,
    pub added: usize,
    pub last_sequence: i64,
}

impl IndexUpdate {
    pub fn is_modified(&self) -> bool {
        self.removed > 0 || self.added > 0
    }
}

/// A raw index row, as returned by `View::dump`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexRow {
    pub sequence: i64,
    pub key: Value,
    pub value: Value,
}

/// Handle to a named view
pub struct View<'s> {
    pub(crate) store: &'s RevisionStore,
    pub(crate) id: i64,
    name: String,
    pub(crate) collation: Collation,
}

impl RevisionStore {
    /// The view called `name`, created if this is its first reference
    pub fn view(&self, name: &str) -> Result<View<'_>> {
        if name.is_empty() {
            return Err(StoreError::bad_request("empty view name"));
        }
        let id = self.db.write(|txn| -> Result<i64> {
            txn.execute("INSERT OR IGNORE INTO views (name) VALUES (?1)", [name])?;
            Ok(txn.query_row("SELECT view_id FROM views WHERE name = ?1", [name], |row| {
                row.get(0)
            })?)
        })?;
        Ok(View::new(self, id, name))
    }

    /// The view called `name` if it has been created
    pub fn existing_view(&self, name: &str) -> Result<Option<View<'_>>> {
        let id = self.db.read(|conn| -> Result<Option<i64>> {
            Ok(conn
                .query_row("SELECT view_id FROM views WHERE name = ?1", [name], |row| row.get(0))
                .optional()?)
        })?;
        Ok(id.map(|id| View::new(self, id, name)))
    }

    pub fn all_views(&self) -> Result<Vec<String>> {
        self.db.read(|conn| -> Result<Vec<String>> {
            let mut stmt = conn.prepare("SELECT name FROM views ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(names)
        })
    }

    /// Delete a view and its index; returns whether it existed
    pub fn delete_view(&self, name: &str) -> Result<bool> {
        let deleted = self.db.write(|txn| -> Result<usize> {
            txn.execute(
                "DELETE FROM maps WHERE view_id IN (SELECT view_id FROM views WHERE name = ?1)",
                [name],
            )?;
            Ok(txn.execute("DELETE FROM views WHERE name = ?1", [name])?)
        })?;
        self.maps.write().remove(name);
        Ok(deleted > 0)
    }
}

impl<'s> View<'s> {
    fn new(store: &'s RevisionStore, id: i64, name: &str) -> Self {
        Self {
            store,
            id,
            name: name.to_string(),
            collation: Collation::Json,
        }
    }

    /// Order keys of this handle's queries with `collation` instead of the
    /// default JSON collation
    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = collation;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Install the map function. When `version` differs from the stored
    /// version the existing index is discarded; returns whether it did.
    pub fn set_map_function<F>(&self, map: F, version: &str) -> Result<bool>
    where
        F: Fn(&Map<String, Value>, &mut Emitter) + Send + Sync + 'static,
    {
        self.store
            .maps
            .write()
            .insert(self.name.clone(), Arc::new(map));

        let changed = self.store.db.write(|txn| -> Result<bool> {
            let stored: Option<String> = txn
                .query_row("SELECT version FROM views WHERE view_id = ?1", [self.id], |row| {
                    row.get(0)
                })
                .optional()?
                .ok_or_else(|| StoreError::not_found(format!("view {}", self.name)))?;
            if stored.as_deref() == Some(version) {
                return Ok(false);
            }
            txn.execute(
                "UPDATE views SET version = ?1, lastsequence = 0 WHERE view_id = ?2",
                params![version, self.id],
            )?;
            txn.execute("DELETE FROM maps WHERE view_id = ?1", [self.id])?;
            Ok(true)
        })?;

        if changed {
            debug!(view = %self.name, version, "map function version changed, index reset");
        }
        Ok(changed)
    }

    pub fn map_version(&self) -> Result<Option<String>> {
        self.store.db.read(|conn| -> Result<Option<String>> {
            Ok(conn
                .query_row("SELECT version FROM views WHERE view_id = ?1", [self.id], |row| {
                    row.get::<_, Option<String>>(0)
                })
                .optional()?
                .flatten())
        })
    }

    pub fn last_sequence_indexed(&self) -> Result<i64> {
        self.store.db.read(|conn| self.read_last_sequence(conn))
    }

    fn read_last_sequence(&self, conn: &Connection) -> Result<i64> {
        conn.query_row("SELECT lastsequence FROM views WHERE view_id = ?1", [self.id], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .optional()?
        .map(|last| last.unwrap_or(0))
        .ok_or_else(|| StoreError::not_found(format!("view {}", self.name)))
    }

    fn map_function(&self) -> Result<Arc<MapFn>> {
        self.store
            .maps
            .read()
            .get(&self.name)
            .cloned()
            .ok_or_else(|| StoreError::bad_request(format!("view {} has no map function", self.name)))
    }

    /// Bring the index up to date with the store.
    ///
    /// Only documents with a revision newer than the last indexed sequence are
    /// touched: their old rows are dropped and their current winner is mapped
    /// again, so each document contributes rows from exactly one revision.
    pub fn update_index(&self) -> Result<IndexUpdate> {
        let map = self.map_function()?;

        let update = self.store.db.write(|txn| -> Result<IndexUpdate> {
            let last = self.read_last_sequence(txn)?;
            let db_max = storage::last_sequence(txn)?;
            if last >= db_max {
                return Ok(IndexUpdate {
                    last_sequence: last,
                    ..IndexUpdate::default()
                });
            }

            let removed = if last == 0 {
                txn.execute("DELETE FROM maps WHERE view_id = ?1", [self.id])?
            } else {
                txn.execute(
                    "DELETE FROM maps WHERE view_id = ?1 AND sequence IN (
                        SELECT sequence FROM revs WHERE doc_id IN (
                            SELECT doc_id FROM revs WHERE sequence > ?2))",
                    params![self.id, last],
                )?
            };

            let winners = {
                let mut stmt = txn.prepare_cached(
                    "SELECT revs.doc_id, sequence, docid, revid, json FROM revs, docs
                     WHERE current = 1 AND deleted = 0 AND revs.doc_id = docs.doc_id
                       AND revs.doc_id IN (SELECT doc_id FROM revs WHERE sequence > ?1)
                     ORDER BY revs.doc_id, revid DESC",
                )?;
                let rows = stmt
                    .query_map([last], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<Vec<u8>>>(4)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };

            let mut added = 0;
            let mut previous_doc = None;
            let mut insert = txn.prepare_cached(
                "INSERT INTO maps (view_id, sequence, key, value) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (doc_key, sequence, doc_id, rev_id, json) in winners {
                // Rows arrive highest revid first; the first one per document wins
                if previous_doc == Some(doc_key) {
                    continue;
                }
                previous_doc = Some(doc_key);

                if doc_id.starts_with(DESIGN_PREFIX) {
                    continue;
                }
                let Some(json) = json else {
                    warn!(doc_id = %doc_id, sequence, "current revision has no body, not indexed");
                    continue;
                };
                let properties =
                    storage::expanded_properties(txn, &doc_id, &rev_id, sequence, false, &json)?;

                let mut emitter = Emitter::default();
                let mapped = panic::catch_unwind(AssertUnwindSafe(|| map(&properties, &mut emitter)));
                if mapped.is_err() {
                    warn!(view = %self.name, doc_id = %doc_id, "map function panicked, index update rolled back");
                    return Err(StoreError::Internal(format!(
                        "map function of view {} panicked on {}",
                        self.name, doc_id
                    )));
                }
                for (key, value) in emitter.rows {
                    insert.execute(params![
                        self.id,
                        sequence,
                        serde_json::to_string(&key)?,
                        serde_json::to_string(&value)?
                    ])?;
                    added += 1;
                }
            }

            txn.execute(
                "UPDATE views SET lastsequence = ?1 WHERE view_id = ?2",
                params![db_max, self.id],
            )?;
            Ok(IndexUpdate {
                removed,
                added,
                last_sequence: db_max,
            })
        })?;

        if update.is_modified() {
            info!(
                view = %self.name,
                removed = update.removed,
                added = update.added,
                last_sequence = update.last_sequence,
                "reindexed view"
            );
        }
        Ok(update)
    }

    /// Drop every index row and reset the cursor; the next update rebuilds
    pub fn remove_index(&self) -> Result<()> {
        self.store.db.write(|txn| -> Result<()> {
            txn.execute("DELETE FROM maps WHERE view_id = ?1", [self.id])?;
            txn.execute("UPDATE views SET lastsequence = 0 WHERE view_id = ?1", [self.id])?;
            Ok(())
        })
    }

    /// Every index row in key order, without updating the index first
    pub fn dump(&self) -> Result<Vec<IndexRow>> {
        let sql = format!(
            "SELECT sequence, key, value FROM maps WHERE view_id = ?1 ORDER BY key COLLATE {}, sequence",
            self.collation.sql_name()
        );
        let rows = self.store.db.read(|conn| -> Result<Vec<(i64, String, Option<String>)>> {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([self.id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(sequence, key, value)| -> Result<IndexRow> {
                Ok(IndexRow {
                    sequence,
                    key: serde_json::from_str(&key)?,
                    value: decode_value(value.as_deref())?,
                })
            })
            .collect()
    }
}

pub(crate) fn decode_value(value: Option<&str>) -> Result<Value> {
    Ok(match value {
        Some(text) => serde_json::from_str(text)?,
        None => Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn by_x(doc: &Map<String, Value>, emitter: &mut Emitter) {
        if let Some(x) = doc.get("x") {
            emitter.emit(x.clone(), Value::Null);
        }
    }

    #[test]
    fn test_view_created_on_first_reference() {
        let store = RevisionStore::in_memory().unwrap();
        assert!(store.existing_view("v").unwrap().is_none());
        let id = store.view("v").unwrap().id();
        assert_eq!(store.view("v").unwrap().id(), id);
        assert_eq!(store.all_views().unwrap(), vec!["v".to_string()]);

        assert!(store.delete_view("v").unwrap());
        assert!(!store.delete_view("v").unwrap());
        assert!(store.all_views().unwrap().is_empty());
    }

    #[test]
    fn test_missing_map_function() {
        let store = RevisionStore::in_memory().unwrap();
        let view = store.view("v").unwrap();
        assert!(matches!(view.update_index(), Err(StoreError::BadRequest(_))));
    }

    #[test]
    fn test_update_is_incremental_and_idempotent() {
        let store = RevisionStore::in_memory().unwrap();
        let view = store.view("v").unwrap();
        view.set_map_function(by_x, "1").unwrap();

        let a = store.put_revision(Some("a"), None, json!({"x": 1}), false).unwrap();
        store.put_revision(Some("b"), None, json!({"x": 2}), false).unwrap();

        let first = view.update_index().unwrap();
        assert_eq!(first.added, 2);
        assert_eq!(view.last_sequence_indexed().unwrap(), store.last_sequence().unwrap());

        let again = view.update_index().unwrap();
        assert!(!again.is_modified());

        store
            .put_revision(Some("a"), Some(&a.rev_id.to_string()), json!({"x": 5}), false)
            .unwrap();
        let next = view.update_index().unwrap();
        assert_eq!((next.removed, next.added), (1, 1));

        let keys: Vec<Value> = view.dump().unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![json!(2), json!(5)]);
    }

    #[test]
    fn test_version_change_resets_index() {
        let store = RevisionStore::in_memory().unwrap();
        let view = store.view("v").unwrap();
        assert!(view.set_map_function(by_x, "1").unwrap());
        assert!(!view.set_map_function(by_x, "1").unwrap());

        store.put_revision(Some("a"), None, json!({"x": 1}), false).unwrap();
        view.update_index().unwrap();
        assert_eq!(view.dump().unwrap().len(), 1);

        assert!(view.set_map_function(by_x, "2").unwrap());
        assert_eq!(view.last_sequence_indexed().unwrap(), 0);
        assert!(view.dump().unwrap().is_empty());
        assert_eq!(view.map_version().unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_design_documents_skipped() {
        let store = RevisionStore::in_memory().unwrap();
        let view = store.view("v").unwrap();
        view.set_map_function(by_x, "1").unwrap();
        store.put_revision(Some("_design/app"), None, json!({"x": 1}), false).unwrap();
        assert_eq!(view.update_index().unwrap().added, 0);
    }

    #[test]
    fn test_remove_index() {
        let store = RevisionStore::in_memory().unwrap();
        let view = store.view("v").unwrap();
        view.set_map_function(by_x, "1").unwrap();
        store.put_revision(Some("a"), None, json!({"x": 1}), false).unwrap();
        view.update_index().unwrap();

        view.remove_index().unwrap();
        assert!(view.dump().unwrap().is_empty());
        assert_eq!(view.last_sequence_indexed().unwrap(), 0);
        assert_eq!(view.update_index().unwrap().added, 1);
    }
}
