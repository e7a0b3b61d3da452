//! RevDB Views
//!
//! Secondary indexes built by running a map function over the winning
//! revision of every document. Indexes are brought up to date lazily, from
//! the sequence they were last indexed at, and queried by key range under
//! JSON collation.

pub mod index;
pub mod query;

pub use index::{Emitter, IndexRow, IndexUpdate, MapFn, View};
pub use query::{QueryOptions, QueryResult, QueryRow};
