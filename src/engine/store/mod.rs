//! RevDB Revision Store
//!
//! Multi-master document storage:
//! - Revision trees with optimistic concurrency
//! - Conflicts kept as parallel leaves, winner chosen deterministically
//! - Replicated histories ingested with `force_insert`
//! - Change feed and post-commit notifications
//! - Attachments in a content-addressed blob store

pub mod attachments;
pub mod blob;
pub mod body;
pub mod changes;
pub mod error;
pub mod replication;
pub mod revision;
pub mod storage;
pub mod validation;

pub use attachments::Attachment;
pub use blob::{BlobError, BlobKey, BlobStore, FileBlobStore, MemoryBlobStore};
pub use changes::{Change, ChangeListener, ChangesFeed};
pub use error::{Result, Status, StoreError};
pub use revision::{RevId, Revision, RevisionList};
pub use storage::{CompactionSummary, RevisionStore, StoreTxn};
pub use validation::{ValidationContext, Validator};
