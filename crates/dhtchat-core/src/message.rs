//! Chat messages: the unit being reconciled between friends.
//!
//! The payload is opaque (signed and encrypted by the entity layer). The
//! content hash covers sender, receiver, timestamp and payload, so the same
//! message always hashes identically on every device.

use bytes::Bytes;
use ciborium::value::Value;

use crate::canonical::{Canonical, MapBuilder, MapReader};
use crate::crypto::PeerKey;
use crate::error::Result;
use crate::types::{MessageHash, Timestamp};

mod keys {
    pub const SENDER: u64 = 0;
    pub const RECEIVER: u64 = 1;
    pub const TIMESTAMP: u64 = 2;
    pub const PAYLOAD: u64 = 3;
}

/// A message between two peers.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Message {
    pub sender: PeerKey,
    pub receiver: PeerKey,
    /// Sender-claimed creation time (Unix ms).
    pub timestamp: Timestamp,
    pub payload: Bytes,
}

impl Message {
    /// Create a new message.
    pub fn new(
        sender: PeerKey,
        receiver: PeerKey,
        timestamp: Timestamp,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            sender,
            receiver,
            timestamp,
            payload: payload.into(),
        }
    }

    /// Content hash over the canonical encoding.
    pub fn hash(&self) -> MessageHash {
        MessageHash::of(&self.to_canonical_bytes())
    }

    /// The peer on the other side of this message, seen from `me`.
    ///
    /// Returns `None` if `me` is neither sender nor receiver.
    pub fn counterpart(&self, me: &PeerKey) -> Option<PeerKey> {
        if &self.sender == me {
            Some(self.receiver)
        } else if &self.receiver == me {
            Some(self.sender)
        } else {
            None
        }
    }
}

impl Canonical for Message {
    const NAME: &'static str = "message";

    fn to_value(&self) -> Value {
        MapBuilder::new()
            .bytes(keys::SENDER, self.sender.as_bytes())
            .bytes(keys::RECEIVER, self.receiver.as_bytes())
            .uint(keys::TIMESTAMP, self.timestamp)
            .bytes(keys::PAYLOAD, &self.payload)
            .build()
    }

    fn from_value(value: &Value) -> Result<Self> {
        let map = MapReader::new(Self::NAME, value)?;
        Ok(Self {
            sender: PeerKey(map.fixed(keys::SENDER)?),
            receiver: PeerKey(map.fixed(keys::RECEIVER)?),
            timestamp: map.uint(keys::TIMESTAMP)?,
            payload: Bytes::copy_from_slice(map.bytes(keys::PAYLOAD)?),
        })
    }
}
