//! # dhtchat Sync
//!
//! Gossip, reconciliation and scheduling engine for DHT-backed chat.
//!
//! ## Overview
//!
//! Nodes never talk to each other directly. Each node writes signed mutable
//! items into a DHT and polls the items its friends write:
//!
//! - a **direct channel** per friend, carrying our message-digest signal and
//!   any messages that friend is missing,
//! - a public **gossip channel** advertising who wrote to whom recently,
//! - a **self channel** shared between installations of one identity.
//!
//! Channel salts rotate every time slice, so stale items fall out of the DHT
//! on their own.
//!
//! ## Key Types
//!
//! - [`Engine`]: the single worker that owns all state and runs the tick loop
//! - [`Dht`]: the asynchronous transport seam, with [`MemoryDht`] for tests
//! - [`EventListener`]: presence, message, receipt and device notifications
//! - [`EngineConfig`]: tunables, deserializable with serde
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dhtchat_core::DeviceId;
//! use dhtchat_store::MemoryRepository;
//! use dhtchat_sync::{Engine, EngineConfig, KeyManager, MemoryDht, NoopListener, SystemClock};
//!
//! async fn example() {
//!     let keys = KeyManager::generate();
//!     let engine = Engine::new(
//!         EngineConfig::default(),
//!         Arc::new(MemoryRepository::new()),
//!         MemoryDht::new(),
//!         &keys,
//!         Arc::new(NoopListener),
//!         Arc::new(SystemClock),
//!         DeviceId::random(),
//!     );
//!
//!     let handle = engine.spawn();
//!     // handle.sender().message_stored(peer, message)?;
//!     handle.shutdown().await.unwrap();
//! }
//! ```
//!
//! ## Tick
//!
//! ```text
//! REFRESH_FRIENDS → SELECT_PEER → POLL → DRAIN_CALLBACKS → PUBLISH_DUE → ADJUST_INTERVAL → SLEEP
//! ```
//!
//! The sleep is cut short when a new message is queued. While the DHT queue
//! is above the configured threshold, requests are held back and the interval
//! doubles.

pub mod channel;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod gossip;
pub mod identity;
pub mod presence;
pub mod reconcile;
pub mod scheduler;
pub mod transport;

pub use channel::{build_batch, BatchLimits, PollTarget, PublishTarget};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, SelectionWeights};
pub use engine::{Command, CommandSender, Engine, EngineHandle, TickReport};
pub use error::{Result, SyncError};
pub use events::{ChannelListener, Event, EventListener, MessageStatus, NoopListener};
pub use gossip::{GossipBook, ReferralQueue};
pub use identity::{IdentityProvider, KeyManager};
pub use presence::{Friend, PresenceTracker};
pub use reconcile::{align, reconcile, Alignment, Reconciliation};
pub use scheduler::{IntervalController, PeerSelector, Selection, SelectionReason, TickPhase};
pub use transport::{memory::MemoryDht, Completion, Dht, DhtRequest, DhtResponse, MutableItem};
