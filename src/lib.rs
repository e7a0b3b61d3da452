//! RevDB - Embedded, offline-first document database for multi-master sync
//!
//! Documents are revision trees stored in SQLite. Replicas that edit the same
//! document while disconnected end up with parallel leaves; both are kept and
//! a deterministic winner is reported until someone resolves the conflict.
//! Views index the winning revision of every document with a map function
//! and are queried by key range under JSON collation.
//!
//! ```no_run
//! use revdb::{QueryOptions, RevisionStore};
//! use serde_json::json;
//!
//! # fn main() -> revdb::Result<()> {
//! let store = RevisionStore::in_memory()?;
//! let rev = store.put_revision(Some("a"), None, json!({"x": 1}), false)?;
//! store.put_revision(Some("a"), Some(&rev.rev_id.to_string()), json!({"x": 2}), false)?;
//!
//! let view = store.view("by_x")?;
//! view.set_map_function(|doc, emit| emit.emit(doc["x"].clone(), json!(null)), "1")?;
//! let result = view.query(&QueryOptions::new())?;
//! assert_eq!(result.rows[0].key, json!(2));
//! # Ok(())
//! # }
//! ```

pub mod engine;

pub use engine::collate::{self, Collation};
pub use engine::config::{ConfigError, StoreConfig};
pub use engine::database::{Database, DatabaseError};
pub use engine::store::{
    Attachment, BlobKey, BlobStore, Change, ChangeListener, ChangesFeed, CompactionSummary,
    FileBlobStore, MemoryBlobStore, Result, RevId, Revision, RevisionList, RevisionStore, Status,
    StoreError, StoreTxn, ValidationContext, Validator,
};
pub use engine::view::{Emitter, IndexRow, IndexUpdate, QueryOptions, QueryResult, QueryRow, View};
