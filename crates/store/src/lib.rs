//! Durable, ordered, branchable event storage.
//!
//! Every session is an append-only DAG of events in SQLite: one `events`
//! table indexed by `(session_id, sequence)` and `(parent_id)`, a `sessions`
//! table holding the head pointer and aggregate stats, a content-addressed
//! `blobs` side-table for oversized payload content, and an FTS5 index over
//! textual payload fields.

pub mod blobs;
pub mod db;
pub mod events;
pub mod schema;
pub mod search;
pub mod sessions;
pub mod tree;

pub use blobs::Blob;
pub use db::Database;
pub use events::{AppendRequest, EventStore};
pub use search::{SearchFilters, SearchHit};
pub use sessions::{SessionFilter, SessionRecord};
pub use tree::{BranchGroup, TreeNode};
