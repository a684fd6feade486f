//! Payloads carried inside mutable data wrappers.

use ciborium::value::Value;

use crate::bloom::BloomFilter;
use crate::canonical::{value_as_fixed, Canonical, MapBuilder, MapReader};
use crate::crypto::PeerKey;
use crate::error::{CoreError, Result};
use crate::gossip::GossipItem;
use crate::message::Message;
use crate::types::{DeviceId, MessageHash, ShortAddress, Timestamp};

// ─────────────────────────────────────────────────────────────────────────────
// NewMsgSignal
// ─────────────────────────────────────────────────────────────────────────────

mod signal_keys {
    pub const DEVICE_ID: u64 = 0;
    pub const HASH_PREFIXES: u64 = 1;
    pub const FRIEND_DIGEST: u64 = 2;
    pub const CHATTING_FRIEND: u64 = 3;
    pub const CHATTING_TIMESTAMP: u64 = 4;
    pub const GOSSIP: u64 = 5;
}

/// Presence and digest state a node publishes on each of its channels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewMsgSignal {
    /// The publishing installation.
    pub device_id: DeviceId,
    /// First byte of each message hash in the sender's recent window with the
    /// receiving peer, oldest first.
    pub hash_prefixes: Vec<u8>,
    /// Friend-list digest, present only on the self channel.
    pub friend_digest: Option<BloomFilter>,
    /// Who the sender is currently chatting with, if anyone.
    pub chatting_friend: Option<ShortAddress>,
    /// When the current chat started (Unix ms); zero without a chatting friend.
    pub chatting_timestamp: Timestamp,
    pub gossip: Vec<GossipItem>,
}

impl NewMsgSignal {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            hash_prefixes: Vec::new(),
            friend_digest: None,
            chatting_friend: None,
            chatting_timestamp: 0,
            gossip: Vec::new(),
        }
    }
}

impl Canonical for NewMsgSignal {
    const NAME: &'static str = "new message signal";

    fn to_value(&self) -> Value {
        let chatting = self
            .chatting_friend
            .map(|s| Value::Bytes(s.as_bytes().to_vec()));
        let chatting_ts = self
            .chatting_friend
            .map(|_| Value::Integer(self.chatting_timestamp.into()));
        MapBuilder::new()
            .bytes(signal_keys::DEVICE_ID, self.device_id.as_bytes())
            .bytes(signal_keys::HASH_PREFIXES, &self.hash_prefixes)
            .opt_value(
                signal_keys::FRIEND_DIGEST,
                self.friend_digest.as_ref().map(Canonical::to_value),
            )
            .opt_value(signal_keys::CHATTING_FRIEND, chatting)
            .opt_value(signal_keys::CHATTING_TIMESTAMP, chatting_ts)
            .array(
                signal_keys::GOSSIP,
                self.gossip.iter().map(Canonical::to_value).collect(),
            )
            .build()
    }

    fn from_value(value: &Value) -> Result<Self> {
        let map = MapReader::new(Self::NAME, value)?;
        let friend_digest = map
            .opt_value(signal_keys::FRIEND_DIGEST)
            .map(BloomFilter::from_value)
            .transpose()?;
        let chatting_friend = map
            .opt_fixed(signal_keys::CHATTING_FRIEND)?
            .map(ShortAddress);
        let chatting_timestamp = match chatting_friend {
            Some(_) => map.uint(signal_keys::CHATTING_TIMESTAMP)?,
            None => 0,
        };
        let gossip = map
            .array(signal_keys::GOSSIP)?
            .iter()
            .map(GossipItem::from_value)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            device_id: DeviceId(map.fixed(signal_keys::DEVICE_ID)?),
            hash_prefixes: map.bytes(signal_keys::HASH_PREFIXES)?.to_vec(),
            friend_digest,
            chatting_friend,
            chatting_timestamp,
            gossip,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MessageList
// ─────────────────────────────────────────────────────────────────────────────

mod list_keys {
    pub const ENTRIES: u64 = 0;
}

/// One entry of a [`MessageList`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageEntry {
    /// The full message, inline.
    Inline(Message),
    /// A message too large to inline, published as an immutable DHT item.
    Reference(MessageHash),
}

impl MessageEntry {
    pub fn hash(&self) -> MessageHash {
        match self {
            MessageEntry::Inline(msg) => msg.hash(),
            MessageEntry::Reference(hash) => *hash,
        }
    }
}

/// Messages the receiver is missing, oldest first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageList {
    pub entries: Vec<MessageEntry>,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: MessageEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop the most recently appended entry.
    pub fn pop_newest(&mut self) -> bool {
        self.entries.pop().is_some()
    }
}

impl Canonical for MessageList {
    const NAME: &'static str = "message list";

    fn to_value(&self) -> Value {
        let entries = self
            .entries
            .iter()
            .map(|entry| match entry {
                MessageEntry::Inline(msg) => msg.to_value(),
                MessageEntry::Reference(hash) => Value::Bytes(hash.as_bytes().to_vec()),
            })
            .collect();
        MapBuilder::new().array(list_keys::ENTRIES, entries).build()
    }

    fn from_value(value: &Value) -> Result<Self> {
        let map = MapReader::new(Self::NAME, value)?;
        let entries = map
            .array(list_keys::ENTRIES)?
            .iter()
            .map(|v| match v {
                Value::Map(_) => Message::from_value(v).map(MessageEntry::Inline),
                Value::Bytes(_) => value_as_fixed(v)
                    .map(|h| MessageEntry::Reference(MessageHash(h)))
                    .ok_or_else(|| CoreError::malformed(Self::NAME, "invalid reference")),
                _ => Err(CoreError::malformed(Self::NAME, "invalid entry")),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FriendInfoList
// ─────────────────────────────────────────────────────────────────────────────

mod friend_keys {
    pub const FRIENDS: u64 = 0;
}

/// Friend public keys shared between devices of one identity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FriendInfoList {
    pub friends: Vec<PeerKey>,
}

impl FriendInfoList {
    pub fn new(friends: Vec<PeerKey>) -> Self {
        Self { friends }
    }

    pub fn pop_newest(&mut self) -> bool {
        self.friends.pop().is_some()
    }
}

impl Canonical for FriendInfoList {
    const NAME: &'static str = "friend info list";

    fn to_value(&self) -> Value {
        MapBuilder::new()
            .array(
                friend_keys::FRIENDS,
                self.friends
                    .iter()
                    .map(|k| Value::Bytes(k.as_bytes().to_vec()))
                    .collect(),
            )
            .build()
    }

    fn from_value(value: &Value) -> Result<Self> {
        let map = MapReader::new(Self::NAME, value)?;
        let friends = map
            .array(friend_keys::FRIENDS)?
            .iter()
            .map(|v| {
                value_as_fixed(v)
                    .map(PeerKey)
                    .ok_or_else(|| CoreError::malformed(Self::NAME, "invalid key"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { friends })
    }
}
