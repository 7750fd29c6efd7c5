//! Error types for the replication engine.

use revsync_protocol::{ProtocolError, ResolveError, RevId};
use revsync_store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// How the coordinator reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried with backoff; never surfaced as fatal.
    Transient,
    /// Malformed response or unexpected status; affects one batch or entry.
    Protocol,
    /// Credentials were rejected.
    Authentication,
    /// A custom resolver failed; the conflict stays open.
    ConflictDeferred,
    /// The local store failed; replication stops.
    Storage,
    /// Any other non-retryable failure.
    Fatal,
}

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A request did not complete in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Not connected to the remote.
    #[error("not connected to remote")]
    NotConnected,

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote answered with an unexpected status code.
    #[error("unexpected status {status} for {path}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Request path, credentials stripped.
        path: String,
    },

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Version mismatch.
    #[error("protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// Local protocol version.
        local: u16,
        /// Remote protocol version.
        remote: u16,
    },

    /// Local store error.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// A conflict resolver deferred.
    #[error(transparent)]
    ConflictDeferred(#[from] ResolveError),

    /// A revision could not be fetched.
    #[error("fetching {doc_id} {rev_id} failed after {attempts} attempts: {reason}")]
    FetchFailed {
        /// Document ID.
        doc_id: String,
        /// Revision ID.
        rev_id: RevId,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        reason: String,
    },

    /// The remote refused a pushed revision.
    #[error("remote rejected {doc_id}: {error} ({reason})")]
    Rejected {
        /// Document ID.
        doc_id: String,
        /// Revision ID, if echoed.
        rev_id: Option<RevId>,
        /// Error code.
        error: String,
        /// Reason given by the remote.
        reason: String,
    },

    /// The configuration cannot work.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A worker task ended abnormally.
    #[error("replication worker failed: {0}")]
    WorkerFailed(String),

    /// Replication was cancelled.
    #[error("replication cancelled")]
    Cancelled,
}

impl From<ProtocolError> for ReplicationError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl ReplicationError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { retryable: true, .. }
            | Self::Timeout(_)
            | Self::NotConnected
            | Self::Cancelled => ErrorKind::Transient,
            Self::Transport {
                retryable: false, ..
            } => ErrorKind::Fatal,
            Self::Status { status, .. } => match status {
                401 | 403 => ErrorKind::Authentication,
                408 | 429 | 500..=599 => ErrorKind::Transient,
                _ => ErrorKind::Protocol,
            },
            Self::AuthenticationFailed(_) => ErrorKind::Authentication,
            Self::Storage(err) if err.is_fatal() => ErrorKind::Storage,
            Self::Storage(_)
            | Self::Protocol(_)
            | Self::FetchFailed { .. }
            | Self::Rejected { .. } => ErrorKind::Protocol,
            Self::ConflictDeferred(_) => ErrorKind::ConflictDeferred,
            Self::VersionMismatch { .. } | Self::Config(_) | Self::WorkerFailed(_) => {
                ErrorKind::Fatal
            }
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Returns true if the error means the remote is unreachable.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                retryable: true,
                ..
            } | Self::Timeout(_)
                | Self::NotConnected
        )
    }

    /// Returns true if replication must stop in the error state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Authentication | ErrorKind::Storage | ErrorKind::Fatal
        )
    }
}
