//! # revsync Engine
//!
//! Bidirectional replication between a local [`RevisionStore`] and a remote
//! database that speaks the CouchDB replication protocol.
//!
//! This crate provides:
//! - A change tracker over `_changes` (normal, longpoll, continuous feeds)
//! - A puller that fetches missing revisions, `_bulk_get` first
//! - A pusher that uploads revisions the remote lacks via `_bulk_docs`
//! - Checkpoints mirrored to the remote as `_local` documents
//! - Conflict resolution through a pluggable [`ConflictResolver`]
//! - A [`Replicator`] that supervises all of the above
//!
//! ## Architecture
//!
//! ```text
//!   remote _changes ──▶ ChangeTracker ──(bounded)──▶ Puller ──▶ RevisionStore
//!                                                               │
//!   remote _bulk_docs ◀────────────── Pusher ◀── changes_since ─┘
//! ```
//!
//! The tracker, puller, and pusher run as tasks of one session. They report
//! progress to the supervisor, which owns the status machine.
//!
//! ## Key Invariants
//!
//! - The pull checkpoint never passes a sequence whose revision is not stored
//! - The push checkpoint advances only after the remote acknowledged a batch
//! - Applying the same revision twice is a no-op
//! - Both peers converge on the same winning revision for every document
//!
//! [`RevisionStore`]: revsync_store::RevisionStore
//! [`ConflictResolver`]: revsync_protocol::ConflictResolver

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod backoff;
mod change_tracker;
mod checkpoint;
mod config;
mod coordinator;
mod error;
mod pending;
mod puller;
mod pusher;
mod remote;
mod resolution;
mod status;
mod transport;

#[cfg(test)]
mod test_support;

pub use checkpoint::CheckpointManager;
pub use config::{
    mask_credentials, AttachmentMode, Direction, FeedMode, RemoteEndpoint, ReplicatorConfig,
    RetryConfig,
};
pub use coordinator::{Replicator, ReplicatorBuilder};
pub use error::{ErrorKind, ReplicationError, ReplicationResult};
pub use remote::{ChangesQuery, RemoteDatabase};
pub use resolution::{resolve_and_apply, ResolveOutcome};
pub use status::{DocumentError, ReplicationStatus, StatusHub, StatusSnapshot};
pub use transport::{
    Authenticator, ByteStream, CredentialRefresher, CredentialStore, Credentials, Method, Request,
    Response, StoredCredentials, StreamResponse, Transport,
};
