//! Gossip items: "who talked to whom, when".

use ciborium::value::Value;

use crate::canonical::{Canonical, MapBuilder, MapReader};
use crate::error::{CoreError, Result};
use crate::types::{ShortAddress, Timestamp};

mod keys {
    pub const SENDER: u64 = 0;
    pub const RECEIVER: u64 = 1;
    pub const TIMESTAMP: u64 = 2;
    pub const STATUS: u64 = 3;
}

/// Activity status attached to a gossip item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum GossipStatus {
    #[default]
    Unknown,
    /// The sender is currently composing a message to the receiver.
    OnWriting,
}

impl GossipStatus {
    pub const fn to_u8(self) -> u8 {
        match self {
            GossipStatus::Unknown => 0,
            GossipStatus::OnWriting => 1,
        }
    }

    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(GossipStatus::Unknown),
            1 => Some(GossipStatus::OnWriting),
            _ => None,
        }
    }
}

/// A record that `sender` published something for `receiver` at `timestamp`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GossipItem {
    pub sender: ShortAddress,
    pub receiver: ShortAddress,
    pub timestamp: Timestamp,
    pub status: GossipStatus,
}

impl GossipItem {
    pub fn new(sender: ShortAddress, receiver: ShortAddress, timestamp: Timestamp) -> Self {
        Self {
            sender,
            receiver,
            timestamp,
            status: GossipStatus::Unknown,
        }
    }

    pub fn with_status(mut self, status: GossipStatus) -> Self {
        self.status = status;
        self
    }

    /// The (sender, receiver) pair used for deduplication.
    pub fn pair(&self) -> (ShortAddress, ShortAddress) {
        (self.sender, self.receiver)
    }
}

impl Canonical for GossipItem {
    const NAME: &'static str = "gossip item";

    fn to_value(&self) -> Value {
        let status = match self.status {
            GossipStatus::Unknown => None,
            other => Some(Value::Integer(other.to_u8().into())),
        };
        MapBuilder::new()
            .bytes(keys::SENDER, self.sender.as_bytes())
            .bytes(keys::RECEIVER, self.receiver.as_bytes())
            .uint(keys::TIMESTAMP, self.timestamp)
            .opt_value(keys::STATUS, status)
            .build()
    }

    fn from_value(value: &Value) -> Result<Self> {
        let map = MapReader::new(Self::NAME, value)?;
        let status = match map.opt_value(keys::STATUS) {
            None => GossipStatus::Unknown,
            Some(_) => {
                let raw = map.uint(keys::STATUS)?;
                u8::try_from(raw)
                    .ok()
                    .and_then(GossipStatus::from_u8)
                    .ok_or_else(|| CoreError::malformed(Self::NAME, "unknown status"))?
            }
        };
        Ok(Self {
            sender: ShortAddress(map.fixed(keys::SENDER)?),
            receiver: ShortAddress(map.fixed(keys::RECEIVER)?),
            timestamp: map.uint(keys::TIMESTAMP)?,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_status_is_omitted() {
        let item = GossipItem::new(ShortAddress([1; 4]), ShortAddress([2; 4]), 5);
        let writing = item.with_status(GossipStatus::OnWriting);
        assert!(item.encoded_len() < writing.encoded_len());

        let decoded = GossipItem::from_canonical_bytes(&writing.to_canonical_bytes()).unwrap();
        assert_eq!(decoded.status, GossipStatus::OnWriting);
        let decoded = GossipItem::from_canonical_bytes(&item.to_canonical_bytes()).unwrap();
        assert_eq!(decoded.status, GossipStatus::Unknown);
    }

    #[test]
    fn test_invalid_status_rejected() {
        let value = MapBuilder::new()
            .bytes(keys::SENDER, &[1; 4])
            .bytes(keys::RECEIVER, &[2; 4])
            .uint(keys::TIMESTAMP, 5)
            .uint(keys::STATUS, 9)
            .build();
        assert!(GossipItem::from_value(&value).is_err());
    }

    #[test]
    fn test_encoded_size_is_small() {
        let item = GossipItem::new(ShortAddress([1; 4]), ShortAddress([2; 4]), u64::MAX)
            .with_status(GossipStatus::OnWriting);
        assert_eq!(item.encoded_len(), 25);
    }
}
