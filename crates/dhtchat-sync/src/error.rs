//! Error types for the sync module.

use thiserror::Error;

/// Errors that can occur while running the engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Repository operation failed. The tick is retried after the minimum interval.
    #[error("store error: {0}")]
    StoreError(#[from] dhtchat_store::StoreError),

    /// Wire data could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] dhtchat_core::CoreError),

    /// A batch could not be brought under the DHT item ceiling.
    #[error("payload of {size} bytes exceeds item limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    /// The engine's command queue is saturated.
    #[error("command queue full")]
    QueueFull,

    /// The engine task has shut down.
    #[error("engine stopped")]
    EngineStopped,
}

impl SyncError {
    /// Whether the failure is local and transient, so the loop should back off and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::StoreError(_) | SyncError::QueueFull)
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
