//! # revsync Protocol
//!
//! Revision-tree data model and wire protocol types for revsync.
//!
//! This crate provides:
//! - [`RevId`] and [`Revision`], the units of replication
//! - [`ChangeEntry`] and the changes-feed parser ([`FeedParser`])
//! - `_revs_diff`, `_bulk_docs` and `_bulk_get` messages
//! - Checkpoint documents and checkpoint-ID derivation
//! - The [`ConflictResolver`] contract and its deterministic default
//!
//! This is a pure protocol crate with no I/O operations. Documents are JSON
//! objects whose non-underscore properties are opaque to replication.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod changes;
mod checkpoint;
mod conflict;
mod error;
mod messages;
mod rev_id;
mod revision;

pub use changes::{ChangeEntry, ChangeRow, ChangesResponse, FeedLine, FeedParser, RemoteSeq, RevRef};
pub use checkpoint::{checkpoint_id, Checkpoint, CheckpointDoc, CheckpointSettings};
pub use conflict::{
    Conflict, ConflictResolver, DefaultResolver, Resolution, ResolveError, ResolverFn,
};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    AttachmentBody, BulkDocsRequest, BulkDocsRow, BulkGetRequest, BulkGetResponse, BulkGetDoc,
    BulkGetResult, BulkGetRef, DatabaseInfo, DocumentBody, IncomingRevision, RevisionHistory,
    RevsDiffEntry, RevsDiffRequest, RevsDiffResponse, PROTOCOL_VERSION,
};
pub use rev_id::RevId;
pub use revision::{attachment_digest, AttachmentRef, Properties, Revision};
