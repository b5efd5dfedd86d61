//! Error types for wire formats.

use thiserror::Error;

/// Result type alias using [`ProtoError`].
pub type Result<T> = std::result::Result<T, ProtoError>;

/// Errors raised while reading or writing wire data.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Decrypted plaintext does not match the payload schema
    #[error("Payload format error: {0}")]
    PayloadFormat(String),

    /// Relay message is missing its `type` or required fields
    #[error("Message format error: {0}")]
    MessageFormat(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
