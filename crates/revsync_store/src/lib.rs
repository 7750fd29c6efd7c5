//! # revsync Store
//!
//! The revision store contract consumed by replication, and an in-memory
//! implementation of it.
//!
//! Documents are stored as revision trees. Replication reads and writes them
//! only through the [`RevisionStore`] trait, so an on-disk engine can stand in
//! for [`MemoryRevisionStore`] without touching the sync engine.
//!
//! ## Design Principles
//!
//! - Trees are append-only arenas keyed by revision ID
//! - Conflict detection and insert are atomic per document
//! - Writers of unrelated documents never contend on the same lock
//! - Attachment blobs are content-addressed and verified on write
//!
//! ## Example
//!
//! ```rust
//! use revsync_store::{InsertOutcome, MemoryRevisionStore, RevisionStore};
//! use revsync_protocol::{RevId, Revision};
//!
//! let store = MemoryRevisionStore::new();
//! let rev = Revision::new("a", RevId::parse("3-zzz").unwrap(), None);
//! let history = [
//!     RevId::parse("3-zzz").unwrap(),
//!     RevId::parse("2-yyy").unwrap(),
//!     RevId::parse("1-xxx").unwrap(),
//! ];
//! let outcome = store.force_insert(rev, &history).unwrap();
//! assert!(matches!(outcome, InsertOutcome::Inserted(_)));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod error;
mod memory;
mod store;
mod tree;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryRevisionStore;
pub use store::{Document, InsertOutcome, RevisionStore};
pub use tree::{RevisionNode, RevisionTree};
