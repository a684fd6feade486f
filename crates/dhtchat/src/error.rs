//! Error types for the node.

use dhtchat_core::PeerKey;
use dhtchat_store::StoreError;
use dhtchat_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync engine error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// Configuration parsed but holds an unusable value.
    #[error("invalid configuration value: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation needs a running engine.
    #[error("node is not running")]
    NotRunning,

    #[error("node is already running")]
    AlreadyRunning,

    /// Messages can only be addressed to friends.
    #[error("not a friend: {0}")]
    NotAFriend(PeerKey),

    /// The encoded message would not fit in one DHT item.
    #[error("message of {size} bytes exceeds the DHT item limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },
}

impl NodeError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Store(_) => true,
            NodeError::Sync(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
