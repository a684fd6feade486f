//! The ChatNode: unified API for dhtchat.
//!
//! A node owns the repository, the identity and the DHT handle, and runs the
//! sync engine in the background between [`ChatNode::start`] and
//! [`ChatNode::stop`].

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use dhtchat_core::{Canonical, DeviceId, Keypair, Message, MessageHash, PeerKey};
use dhtchat_store::{Repository, SqliteRepository};
use dhtchat_sync::{
    Clock, CommandSender, Dht, Engine, EngineHandle, EventListener, KeyManager, SystemClock,
};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};

/// The main node struct.
///
/// Provides a unified API for:
/// - Managing friends and the chatting friend
/// - Sending messages
/// - Running background sync over a DHT
pub struct ChatNode<R: Repository, D: Dht> {
    config: NodeConfig,
    keys: KeyManager,
    repo: Arc<R>,
    dht: D,
    listener: Arc<dyn EventListener>,
    clock: Arc<dyn Clock>,
    device_id: DeviceId,
    engine: Option<EngineHandle>,
}

impl<R, D> ChatNode<R, D>
where
    R: Repository + 'static,
    D: Dht + Clone + 'static,
{
    /// Create a node. Nothing touches the DHT until [`ChatNode::start`].
    pub fn new(
        config: NodeConfig,
        keys: KeyManager,
        repo: R,
        dht: D,
        listener: Arc<dyn EventListener>,
    ) -> Result<Self> {
        config.validate()?;
        let device_id = config.device_id()?;
        Ok(Self {
            config,
            keys,
            repo: Arc::new(repo),
            dht,
            listener,
            clock: Arc::new(SystemClock),
            device_id,
            engine: None,
        })
    }

    /// Replace the time source. Takes effect at the next start.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn public_key(&self) -> PeerKey {
        self.keys.public_key()
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn is_running(&self) -> bool {
        self.engine.as_ref().map(EngineHandle::is_running).unwrap_or(false)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Spawn the sync engine on the current tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(NodeError::AlreadyRunning);
        }
        let engine = Engine::new(
            self.config.engine.clone(),
            self.repo.clone(),
            self.dht.clone(),
            &self.keys,
            self.listener.clone(),
            self.clock.clone(),
            self.device_id,
        );
        info!(key = %self.public_key(), device = %self.device_id, "starting node");
        self.engine = Some(engine.spawn());
        Ok(())
    }

    /// Stop the engine and wait for it to finish its current step.
    ///
    /// Stopping a node that is not running is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(handle) = self.engine.take() {
            handle.shutdown().await?;
            info!("node stopped");
        }
        Ok(())
    }

    fn sender(&self) -> Result<&CommandSender> {
        match &self.engine {
            Some(handle) if handle.is_running() => Ok(handle.sender()),
            _ => Err(NodeError::NotRunning),
        }
    }

    fn wake(&self) {
        if let Some(handle) = &self.engine {
            handle.sender().wake();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Identity
    // ─────────────────────────────────────────────────────────────────────────

    /// Switch to a new identity. The engine drops every cache tied to the old one.
    pub fn rotate_identity(&self, keypair: Keypair) {
        self.keys.rotate(keypair);
        self.wake();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Friends
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a friend. Returns `false` if already present.
    pub async fn add_friend(&self, key: &PeerKey) -> Result<bool> {
        if *key == self.public_key() {
            return Err(NodeError::InvalidArgument("cannot befriend our own key".into()));
        }
        let added = self.repo.add_friend(key).await?;
        if added {
            debug!(friend = %key, "friend added");
            self.wake();
        }
        Ok(added)
    }

    /// Remove a friend. Returns `false` if unknown.
    pub async fn remove_friend(&self, key: &PeerKey) -> Result<bool> {
        let removed = self.repo.remove_friend(key).await?;
        if removed {
            debug!(friend = %key, "friend removed");
            self.wake();
        }
        Ok(removed)
    }

    pub async fn friends(&self) -> Result<Vec<PeerKey>> {
        Ok(self.repo.list_friends().await?)
    }

    /// Set (or clear) the friend whose conversation is open.
    pub async fn set_chatting_friend(&self, key: Option<&PeerKey>) -> Result<()> {
        if let Some(key) = key {
            self.require_friend(key).await?;
        }
        self.repo.set_chatting_friend(key).await?;
        self.wake();
        Ok(())
    }

    async fn require_friend(&self, key: &PeerKey) -> Result<()> {
        if self.repo.list_friends().await?.contains(key) {
            Ok(())
        } else {
            Err(NodeError::NotAFriend(*key))
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist a message to `peer` and hand it to the engine for publication.
    ///
    /// Messages whose encoding exceeds the DHT item limit are refused before
    /// anything is stored. Fails with a retryable error when the engine's
    /// command queue is full; the message stays stored and goes out with the
    /// next reconciliation.
    pub async fn publish_new_message(
        &self,
        peer: &PeerKey,
        payload: impl Into<Bytes>,
    ) -> Result<MessageHash> {
        let sender = self.sender()?;
        self.require_friend(peer).await?;

        let message = Message::new(self.public_key(), *peer, self.clock.now_millis(), payload);
        let size = message.encoded_len();
        let limit = self.item_limit();
        if size > limit {
            return Err(NodeError::MessageTooLarge { size, limit });
        }
        let hash = message.hash();
        self.repo.save_message(peer, &message).await?;
        sender.message_stored(*peer, message)?;
        debug!(%peer, %hash, "message queued");
        Ok(hash)
    }

    fn item_limit(&self) -> usize {
        self.config
            .engine
            .item_size_limit
            .min(self.dht.item_size_limit())
    }

    /// The newest `limit` messages exchanged with `peer`, oldest first.
    pub async fn conversation(&self, peer: &PeerKey, limit: usize) -> Result<Vec<Message>> {
        Ok(self.repo.latest_messages(peer, limit).await?)
    }
}

impl<D> ChatNode<SqliteRepository, D>
where
    D: Dht + Clone + 'static,
{
    /// Open the SQLite database named in `config.database` and build a node on it.
    pub fn open(
        config: NodeConfig,
        keys: KeyManager,
        dht: D,
        listener: Arc<dyn EventListener>,
    ) -> Result<Self> {
        let path = config
            .database
            .clone()
            .ok_or_else(|| NodeError::InvalidConfig("database path not set".into()))?;
        let repo = SqliteRepository::open(&path)?;
        Self::new(config, keys, repo, dht, listener)
    }
}

impl<R: Repository, D: Dht> std::fmt::Debug for ChatNode<R, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatNode")
            .field("key", &self.keys.public_key())
            .field("device_id", &self.device_id)
            .field("running", &self.engine.is_some())
            .finish()
    }
}
