//! # dhtchat Testkit
//!
//! Testing utilities for dhtchat.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: deterministic parties, conversations and engines wired to
//!   the in-memory DHT and a manual clock
//! - **Generators**: Proptest strategies for keys, messages, gossip items and
//!   digest windows
//! - **Benchmarks**: `cargo bench -p dhtchat-testkit` times digest alignment
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use dhtchat_testkit::generators::prefixes_with_subsequence;
//!
//! proptest! {
//!     #[test]
//!     fn gap_is_found((full, kept) in prefixes_with_subsequence(64)) {
//!         let alignment = dhtchat_sync::align(&kept, &full);
//!         prop_assert_eq!(alignment.missing.len(), full.len() - kept.len());
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust
//! use dhtchat_testkit::fixtures::{multi_party, test_clock};
//! use dhtchat_sync::{EngineConfig, MemoryDht};
//!
//! let parties = multi_party(2);
//! let dht = MemoryDht::new();
//! let (engine, _events) = parties[0].engine(&dht, &test_clock(), EngineConfig::for_testing(1));
//! assert_eq!(engine.public_key(), parties[0].public_key());
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{multi_party, Party, TestEngine, TEST_EPOCH_MS};
