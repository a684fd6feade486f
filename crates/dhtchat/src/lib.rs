//! # dhtchat
//!
//! The unified API for dhtchat: serverless one-to-one messaging where every
//! exchange happens through signed items in a distributed hash table.
//!
//! ## Overview
//!
//! - **Friends**: the peers we exchange messages with, kept in a repository
//! - **Messages**: immutable, content-addressed, stored locally and published
//!   as immutable DHT items
//! - **Sync**: a background engine that polls friends' channels, reconciles
//!   message digests and gossips who wrote to whom
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dhtchat::{ChatNode, NodeConfig};
//! use dhtchat::sync::{KeyManager, MemoryDht, NoopListener};
//!
//! async fn example() -> dhtchat::Result<()> {
//!     let config = NodeConfig::from_json(r#"{ "database": "chat.db" }"#)?;
//!     let mut node = ChatNode::open(
//!         config,
//!         KeyManager::generate(),
//!         MemoryDht::new(),
//!         Arc::new(NoopListener),
//!     )?;
//!     node.start()?;
//!
//!     // let friend: PeerKey = ...;
//!     // node.add_friend(&friend).await?;
//!     // node.publish_new_message(&friend, b"hello".to_vec()).await?;
//!
//!     node.stop().await
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `dhtchat::core` - Keys, messages, wire wrappers and codec
//! - `dhtchat::store` - Repository trait, in-memory and SQLite backends
//! - `dhtchat::sync` - The gossip and reconciliation engine

pub mod config;
pub mod error;
pub mod node;

// Re-export component crates
pub use dhtchat_core as core;
pub use dhtchat_store as store;
pub use dhtchat_sync as sync;

pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use node::ChatNode;

// Re-export commonly used types
pub use dhtchat_core::{DeviceId, Keypair, Message, MessageHash, PeerKey};
pub use dhtchat_sync::{Event, EventListener, MessageStatus};
