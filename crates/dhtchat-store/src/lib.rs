//! # dhtchat Store
//!
//! Storage abstraction for dhtchat. Provides a trait-based interface for
//! friend, message and settings persistence with SQLite and in-memory
//! implementations.
//!
//! ## Overview
//!
//! The store module abstracts persistence behind the [`Repository`] trait,
//! allowing the sync engine to be storage-agnostic. The primary
//! implementation is [`SqliteRepository`], with [`MemoryRepository`] for
//! testing.
//!
//! ## Key Types
//!
//! - [`Repository`] - The async trait for all storage operations
//! - [`RepositoryExt`] - Typed accessors layered over settings
//! - [`SqliteRepository`] - SQLite-based persistent storage
//! - [`MemoryRepository`] - In-memory storage for tests
//! - [`InsertResult`] - Result of saving a message
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dhtchat_store::{Repository, SqliteRepository};
//! use dhtchat_core::Keypair;
//!
//! async fn example() {
//!     let repo = SqliteRepository::open("chat.db").unwrap();
//!
//!     let friend = Keypair::generate().public_key();
//!     repo.add_friend(&friend).await.unwrap();
//!
//!     let window = repo.latest_messages(&friend, 256).await.unwrap();
//!     println!("{} messages with {}", window.len(), friend);
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent saves**: Saving the same message twice returns `AlreadyExists`
//! - **Bounded windows**: Reconciliation only ever reads the newest N messages
//! - **Settings as strings**: Typed overrides are parsed by [`RepositoryExt`]

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;
pub use traits::{settings, InsertResult, Repository, RepositoryExt};
