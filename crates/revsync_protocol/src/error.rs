//! Error types for protocol parsing.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while parsing or building wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A revision ID did not have the `<generation>-<digest>` shape.
    #[error("invalid revision id: {0:?}")]
    InvalidRevId(String),

    /// JSON could not be decoded into the expected message.
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A message decoded but violated a structural rule.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Inline attachment data was not valid base64.
    #[error("invalid attachment encoding for {name}: {reason}")]
    InvalidAttachment {
        /// Attachment name.
        name: String,
        /// Decoder message.
        reason: String,
    },
}

impl ProtocolError {
    /// Creates an invalid-message error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidMessage(message.into())
    }
}
