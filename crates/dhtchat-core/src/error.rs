//! Error types for dhtchat core.

use thiserror::Error;

/// Core errors that can occur while encoding, decoding or verifying wire data.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("unknown wrapper type: {0}")]
    UnknownWrapperType(u64),

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

impl CoreError {
    pub(crate) fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        CoreError::Malformed {
            what,
            reason: reason.into(),
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
