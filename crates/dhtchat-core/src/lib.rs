//! # dhtchat Core
//!
//! Pure primitives for dhtchat: peer identities, messages, gossip items and
//! the wire wrappers published on DHT channels.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over the data structures two friends exchange through a DHT.
//!
//! ## Key Types
//!
//! - [`PeerKey`] - Ed25519 public key identifying a peer
//! - [`ShortAddress`] - 4-byte key prefix used inside gossip items
//! - [`Message`] - A chat message with a stable [`MessageHash`]
//! - [`GossipItem`] - "sender wrote to receiver at time t"
//! - [`NewMsgSignal`] - Per-channel presence and digest state
//! - [`MutableDataWrapper`] / [`Batch`] - What one mutable DHT item holds
//! - [`BloomFilter`] - Friend-list digest shared between own devices
//!
//! ## Canonicalization
//!
//! All wire types are encoded as integer-keyed canonical CBOR maps. See the
//! [`canonical`] module.

pub mod bloom;
pub mod canonical;
pub mod crypto;
pub mod error;
pub mod gossip;
pub mod message;
pub mod signal;
pub mod types;
pub mod wrapper;

pub use bloom::BloomFilter;
pub use canonical::{decode_value, encode_value, Canonical};
pub use crypto::{Keypair, PeerKey, Signature};
pub use error::{CoreError, Result};
pub use gossip::{GossipItem, GossipStatus};
pub use message::Message;
pub use signal::{FriendInfoList, MessageEntry, MessageList, NewMsgSignal};
pub use types::{DeviceId, MessageHash, ShortAddress, Timestamp, SHORT_ADDRESS_LENGTH};
pub use wrapper::{Batch, MutableDataWrapper, WrapperPayload, WrapperType};
