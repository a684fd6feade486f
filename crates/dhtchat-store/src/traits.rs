//! Repository trait: the abstract interface for friend and message persistence.
//!
//! This trait allows the sync engine to be storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use std::time::Duration;

use async_trait::async_trait;
use dhtchat_core::{Message, MessageHash, PeerKey};

use crate::error::Result;

/// Well-known setting keys.
pub mod settings {
    /// Overrides the scheduler's minimum loop interval, in milliseconds.
    pub const LOOP_INTERVAL_MS: &str = "loop_interval_ms";
}

/// Result of saving a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// Message was stored.
    Inserted,
    /// A message with the same hash is already stored (idempotent - not an error).
    AlreadyExists,
}

/// The Repository trait: async interface for everything the engine persists.
///
/// All methods are async to support both blocking (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Design Notes
///
/// - **Conversations are keyed by peer**: a message is filed under the peer on
///   the other side, so rotating the local identity does not orphan history.
/// - **Idempotent saves**: saving the same message twice returns `AlreadyExists`.
/// - **Windows are chronological**: `latest_messages` returns the newest `limit`
///   messages ordered oldest first, ties broken by hash.
#[async_trait]
pub trait Repository: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Friends
    // ─────────────────────────────────────────────────────────────────────────

    /// List all friends in the order they were added.
    async fn list_friends(&self) -> Result<Vec<PeerKey>>;

    /// Add a friend. Returns `false` if already present.
    async fn add_friend(&self, key: &PeerKey) -> Result<bool>;

    /// Remove a friend. Returns `false` if not present.
    ///
    /// Stored messages are kept.
    async fn remove_friend(&self, key: &PeerKey) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Save a message under the conversation with `peer`.
    async fn save_message(&self, peer: &PeerKey, message: &Message) -> Result<InsertResult>;

    /// Get a message by its content hash.
    async fn get_message(&self, hash: &MessageHash) -> Result<Option<Message>>;

    /// Check if a message exists by hash.
    async fn has_message(&self, hash: &MessageHash) -> Result<bool>;

    /// The newest `limit` messages exchanged with `peer`, oldest first.
    async fn latest_messages(&self, peer: &PeerKey, limit: usize) -> Result<Vec<Message>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Chat state and settings
    // ─────────────────────────────────────────────────────────────────────────

    /// The friend whose conversation is currently open, if any.
    async fn chatting_friend(&self) -> Result<Option<PeerKey>>;

    /// Set or clear the currently open conversation.
    async fn set_chatting_friend(&self, peer: Option<&PeerKey>) -> Result<()>;

    /// Get an arbitrary setting.
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    /// Set an arbitrary setting.
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// Extension trait for common repository patterns.
pub trait RepositoryExt: Repository {
    /// The configured minimum loop interval, if set.
    ///
    /// Unparseable or zero values are ignored.
    fn loop_interval_override(
        &self,
    ) -> impl std::future::Future<Output = Result<Option<Duration>>> + Send;
}

impl<R: Repository + ?Sized> RepositoryExt for R {
    async fn loop_interval_override(&self) -> Result<Option<Duration>> {
        let raw = self.get_setting(settings::LOOP_INTERVAL_MS).await?;
        Ok(raw.and_then(|value| match value.trim().parse::<u64>() {
            Ok(0) => None,
            Ok(ms) => Some(Duration::from_millis(ms)),
            Err(e) => {
                tracing::warn!("ignoring invalid {} setting {:?}: {}", settings::LOOP_INTERVAL_MS, value, e);
                None
            }
        }))
    }
}

/// Order messages chronologically, breaking timestamp ties by hash.
pub(crate) fn sort_chronologically(messages: &mut [(MessageHash, Message)]) {
    messages.sort_by(|(ha, a), (hb, b)| a.timestamp.cmp(&b.timestamp).then_with(|| ha.cmp(hb)));
}
