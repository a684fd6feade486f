//! Mutable data wrappers: the typed units batched into one mutable DHT item.

use ciborium::value::Value;

use crate::canonical::{Canonical, MapBuilder, MapReader};
use crate::error::{CoreError, Result};
use crate::signal::{FriendInfoList, MessageList, NewMsgSignal};
use crate::types::Timestamp;

mod keys {
    pub const KIND: u64 = 0;
    pub const TIMESTAMP: u64 = 1;
    pub const PAYLOAD: u64 = 2;
}

mod batch_keys {
    pub const WRAPPERS: u64 = 0;
}

/// Discriminator for wrapper payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WrapperType {
    NewMsgSignal,
    MessageList,
    FriendInfoList,
}

impl WrapperType {
    pub const fn to_u64(self) -> u64 {
        match self {
            WrapperType::NewMsgSignal => 0,
            WrapperType::MessageList => 1,
            WrapperType::FriendInfoList => 2,
        }
    }

    pub const fn from_u64(v: u64) -> Option<Self> {
        match v {
            0 => Some(WrapperType::NewMsgSignal),
            1 => Some(WrapperType::MessageList),
            2 => Some(WrapperType::FriendInfoList),
            _ => None,
        }
    }

    /// Retention priority when a batch exceeds its budget; lower is kept longer.
    ///
    /// The signal always survives. Friend info is the first to go since it is
    /// recomputed on every self-channel publish.
    pub const fn drop_priority(self) -> u8 {
        match self {
            WrapperType::NewMsgSignal => 0,
            WrapperType::MessageList => 1,
            WrapperType::FriendInfoList => 2,
        }
    }
}

/// The typed content of a wrapper.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WrapperPayload {
    Signal(NewMsgSignal),
    Messages(MessageList),
    FriendInfo(FriendInfoList),
}

/// One typed, timestamped payload inside a mutable DHT item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutableDataWrapper {
    /// Publisher's clock when the wrapper was built (Unix ms).
    pub timestamp: Timestamp,
    pub payload: WrapperPayload,
}

impl MutableDataWrapper {
    pub fn signal(timestamp: Timestamp, signal: NewMsgSignal) -> Self {
        Self {
            timestamp,
            payload: WrapperPayload::Signal(signal),
        }
    }

    pub fn messages(timestamp: Timestamp, list: MessageList) -> Self {
        Self {
            timestamp,
            payload: WrapperPayload::Messages(list),
        }
    }

    pub fn friend_info(timestamp: Timestamp, list: FriendInfoList) -> Self {
        Self {
            timestamp,
            payload: WrapperPayload::FriendInfo(list),
        }
    }

    pub fn kind(&self) -> WrapperType {
        match self.payload {
            WrapperPayload::Signal(_) => WrapperType::NewMsgSignal,
            WrapperPayload::Messages(_) => WrapperType::MessageList,
            WrapperPayload::FriendInfo(_) => WrapperType::FriendInfoList,
        }
    }

    /// Drop the newest-appended truncatable entry of the payload.
    ///
    /// For a signal this sheds embedded gossip; the digest itself is never cut.
    /// Returns `false` when nothing is left to drop.
    pub fn truncate_newest(&mut self) -> bool {
        match &mut self.payload {
            WrapperPayload::Signal(signal) => signal.gossip.pop().is_some(),
            WrapperPayload::Messages(list) => list.pop_newest(),
            WrapperPayload::FriendInfo(list) => list.pop_newest(),
        }
    }

    /// Whether truncation has emptied the payload.
    pub fn is_empty(&self) -> bool {
        match &self.payload {
            WrapperPayload::Signal(_) => false,
            WrapperPayload::Messages(list) => list.is_empty(),
            WrapperPayload::FriendInfo(list) => list.friends.is_empty(),
        }
    }

    /// Blake3 digest of the canonical encoding, used to skip already-seen signals.
    pub fn digest(&self) -> [u8; 32] {
        *blake3::hash(&self.to_canonical_bytes()).as_bytes()
    }
}

impl Canonical for MutableDataWrapper {
    const NAME: &'static str = "mutable data wrapper";

    fn to_value(&self) -> Value {
        let payload = match &self.payload {
            WrapperPayload::Signal(s) => s.to_value(),
            WrapperPayload::Messages(m) => m.to_value(),
            WrapperPayload::FriendInfo(f) => f.to_value(),
        };
        MapBuilder::new()
            .uint(keys::KIND, self.kind().to_u64())
            .uint(keys::TIMESTAMP, self.timestamp)
            .value(keys::PAYLOAD, payload)
            .build()
    }

    fn from_value(value: &Value) -> Result<Self> {
        let map = MapReader::new(Self::NAME, value)?;
        let raw_kind = map.uint(keys::KIND)?;
        let kind = WrapperType::from_u64(raw_kind).ok_or(CoreError::UnknownWrapperType(raw_kind))?;
        let payload = map.value(keys::PAYLOAD)?;
        let payload = match kind {
            WrapperType::NewMsgSignal => WrapperPayload::Signal(NewMsgSignal::from_value(payload)?),
            WrapperType::MessageList => WrapperPayload::Messages(MessageList::from_value(payload)?),
            WrapperType::FriendInfoList => {
                WrapperPayload::FriendInfo(FriendInfoList::from_value(payload)?)
            }
        };
        Ok(Self {
            timestamp: map.uint(keys::TIMESTAMP)?,
            payload,
        })
    }
}

/// The value stored in one mutable DHT item: an ordered list of wrappers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    pub wrappers: Vec<MutableDataWrapper>,
}

impl Batch {
    pub fn new(wrappers: Vec<MutableDataWrapper>) -> Self {
        Self { wrappers }
    }

    pub fn len(&self) -> usize {
        self.wrappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }

    /// The first signal wrapper in the batch, if any.
    pub fn signal(&self) -> Option<(&MutableDataWrapper, &NewMsgSignal)> {
        self.wrappers.iter().find_map(|w| match &w.payload {
            WrapperPayload::Signal(s) => Some((w, s)),
            _ => None,
        })
    }
}

impl Canonical for Batch {
    const NAME: &'static str = "batch";

    fn to_value(&self) -> Value {
        MapBuilder::new()
            .array(
                batch_keys::WRAPPERS,
                self.wrappers.iter().map(Canonical::to_value).collect(),
            )
            .build()
    }

    fn from_value(value: &Value) -> Result<Self> {
        let map = MapReader::new(Self::NAME, value)?;
        let wrappers = map
            .array(batch_keys::WRAPPERS)?
            .iter()
            .map(MutableDataWrapper::from_value)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { wrappers })
    }
}
