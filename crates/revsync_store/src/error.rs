//! Error types for revision store operations.

use revsync_protocol::{ProtocolError, RevId};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The document does not exist.
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// A local edit named a parent that is not the current revision.
    #[error("conflict on {doc_id}: current revision is {current:?}")]
    Conflict {
        /// Document ID.
        doc_id: String,
        /// Current revision, `None` if the document does not exist.
        current: Option<RevId>,
    },

    /// A local edit named a parent that does not exist.
    #[error("missing parent {parent} for {doc_id}")]
    MissingParent {
        /// Document ID.
        doc_id: String,
        /// Parent that was not found.
        parent: RevId,
    },

    /// The leaves a resolution was computed against are no longer leaves.
    #[error("stale conflict resolution for {doc_id}")]
    StaleResolution {
        /// Document ID.
        doc_id: String,
    },

    /// A revision referenced an attachment blob that is not stored.
    #[error("attachment blob missing: {digest}")]
    BlobMissing {
        /// Content digest.
        digest: String,
    },

    /// Blob bytes did not hash to the expected digest.
    #[error("attachment digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest the caller claimed.
        expected: String,
        /// Digest of the bytes received.
        actual: String,
    },

    /// The revision history supplied with a forced insert is inconsistent.
    #[error("invalid revision history for {doc_id}: {reason}")]
    InvalidHistory {
        /// Document ID.
        doc_id: String,
        /// What was wrong.
        reason: String,
    },

    /// The store has no room for more data.
    #[error("store is full")]
    Full,

    /// Stored data is corrupted.
    #[error("store corrupted: {0}")]
    Corrupted(String),

    /// A stored value could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl StoreError {
    /// Returns true if the store cannot be trusted with further writes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Full | StoreError::Corrupted(_))
    }

    /// Returns true if the error only affects the revision being written.
    pub fn is_per_revision(&self) -> bool {
        matches!(
            self,
            StoreError::BlobMissing { .. }
                | StoreError::DigestMismatch { .. }
                | StoreError::InvalidHistory { .. }
                | StoreError::StaleResolution { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors() {
        assert!(StoreError::Full.is_fatal());
        assert!(StoreError::Corrupted("bad page".into()).is_fatal());
        assert!(!StoreError::DocumentNotFound("a".into()).is_fatal());
    }

    #[test]
    fn per_revision_errors() {
        let err = StoreError::BlobMissing {
            digest: "sha256-00".into(),
        };
        assert!(err.is_per_revision());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("sha256-00"));
    }
}
