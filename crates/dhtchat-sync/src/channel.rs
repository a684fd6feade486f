//! Channel addressing and batch assembly.
//!
//! Every node publishes three kinds of mutable items, all signed with its own
//! key and distinguished by salt:
//!
//! - a **direct** channel per friend, salted with both short addresses,
//! - a **self** channel, the direct channel addressed to itself,
//! - a **gossip** channel readable by anyone.
//!
//! Salts end with the epoch number (`now / time_slice`), so each channel
//! moves to a fresh DHT slot at every slice boundary.

use dhtchat_core::{Batch, Canonical, MutableDataWrapper, PeerKey, Timestamp, WrapperType};

use crate::error::{Result, SyncError};

/// Prefix of the gossip channel salt.
pub const GOSSIP_SALT_PREFIX: &[u8] = b"gossip";

/// The epoch containing `now`.
pub fn epoch(now: Timestamp, slice_ms: u64) -> u64 {
    now / slice_ms.max(1)
}

/// Salt of the channel `publisher` writes for `reader` in `epoch`.
pub fn direct_salt(publisher: &PeerKey, reader: &PeerKey, epoch: u64) -> Vec<u8> {
    let mut salt = Vec::with_capacity(16);
    salt.extend_from_slice(publisher.short_address().as_bytes());
    salt.extend_from_slice(reader.short_address().as_bytes());
    salt.extend_from_slice(&epoch.to_be_bytes());
    salt
}

pub fn gossip_salt(epoch: u64) -> Vec<u8> {
    let mut salt = Vec::with_capacity(GOSSIP_SALT_PREFIX.len() + 8);
    salt.extend_from_slice(GOSSIP_SALT_PREFIX);
    salt.extend_from_slice(&epoch.to_be_bytes());
    salt
}

/// A channel this node reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PollTarget {
    /// What `peer` publishes for us.
    Direct(PeerKey),
    /// `peer`'s public gossip channel.
    Gossip(PeerKey),
    /// Our own self channel, written by our other devices.
    SelfSync,
}

impl PollTarget {
    /// The key the channel is published under.
    pub fn owner(&self, me: &PeerKey) -> PeerKey {
        match self {
            PollTarget::Direct(peer) | PollTarget::Gossip(peer) => *peer,
            PollTarget::SelfSync => *me,
        }
    }

    /// The peer whose poll cooldown this read consumes.
    pub fn peer(&self) -> Option<PeerKey> {
        match self {
            PollTarget::Direct(peer) | PollTarget::Gossip(peer) => Some(*peer),
            PollTarget::SelfSync => None,
        }
    }

    pub fn salt(&self, me: &PeerKey, epoch: u64) -> Vec<u8> {
        match self {
            PollTarget::Direct(peer) => direct_salt(peer, me, epoch),
            PollTarget::Gossip(_) => gossip_salt(epoch),
            PollTarget::SelfSync => direct_salt(me, me, epoch),
        }
    }
}

/// A channel this node writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PublishTarget {
    Direct(PeerKey),
    Gossip,
    SelfSync,
}

impl PublishTarget {
    pub fn salt(&self, me: &PeerKey, epoch: u64) -> Vec<u8> {
        match self {
            PublishTarget::Direct(peer) => direct_salt(me, peer, epoch),
            PublishTarget::Gossip => gossip_salt(epoch),
            PublishTarget::SelfSync => direct_salt(me, me, epoch),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Batch assembly
// ─────────────────────────────────────────────────────────────────────────────

/// Budget for one mutable item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_wrappers: usize,
    pub max_bytes: usize,
}

/// Position of a wrapper kind in the encoded batch.
fn output_rank(kind: WrapperType) -> u8 {
    match kind {
        WrapperType::NewMsgSignal => 0,
        WrapperType::FriendInfoList => 1,
        WrapperType::MessageList => 2,
    }
}

/// Pack candidate wrappers into one batch within `limits`.
///
/// Wrappers are admitted in retention order (signal, then message lists, then
/// friend info). A wrapper that does not fit loses its newest entries until it
/// does; once anything has been cut, no lower-priority wrapper is admitted.
/// The signal is never dropped: if it cannot fit even with all gossip shed,
/// the whole batch fails with [`SyncError::PayloadTooLarge`].
pub fn build_batch(mut candidates: Vec<MutableDataWrapper>, limits: BatchLimits) -> Result<Batch> {
    candidates.retain(|w| !w.is_empty());
    candidates.sort_by_key(|w| w.kind().drop_priority());

    let mut batch = Batch::default();
    let mut cut = false;

    for mut wrapper in candidates {
        let kind = wrapper.kind();
        let is_signal = kind == WrapperType::NewMsgSignal;
        if cut && !is_signal {
            break;
        }
        if batch.len() >= limits.max_wrappers {
            if is_signal {
                return Err(SyncError::PayloadTooLarge {
                    size: batch.encoded_len(),
                    limit: limits.max_bytes,
                });
            }
            break;
        }

        batch.wrappers.push(wrapper.clone());
        while batch.encoded_len() > limits.max_bytes {
            cut = true;
            batch.wrappers.pop();
            if !wrapper.truncate_newest() || wrapper.is_empty() {
                if is_signal {
                    let mut alone = Batch::default();
                    alone.wrappers.push(wrapper);
                    return Err(SyncError::PayloadTooLarge {
                        size: alone.encoded_len(),
                        limit: limits.max_bytes,
                    });
                }
                tracing::trace!(?kind, "wrapper dropped from batch");
                break;
            }
            batch.wrappers.push(wrapper.clone());
        }
    }

    batch.wrappers.sort_by_key(|w| output_rank(w.kind()));
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dhtchat_core::{
        DeviceId, FriendInfoList, GossipItem, Message, MessageEntry, MessageList, NewMsgSignal,
        ShortAddress, WrapperPayload,
    };
    use proptest::prelude::*;

    fn key(n: u8) -> PeerKey {
        PeerKey::from_bytes([n; 32])
    }

    fn signal() -> MutableDataWrapper {
        let mut s = NewMsgSignal::new(DeviceId::from_bytes([9; 16]));
        s.hash_prefixes = vec![1, 2, 3];
        MutableDataWrapper::signal(100, s)
    }

    fn messages(count: usize, payload: usize) -> MutableDataWrapper {
        let mut list = MessageList::new();
        for i in 0..count {
            list.push(MessageEntry::Inline(Message::new(
                key(1),
                key(2),
                i as u64,
                vec![0xAB; payload],
            )));
        }
        MutableDataWrapper::messages(100, list)
    }

    fn friends(count: u8) -> MutableDataWrapper {
        MutableDataWrapper::friend_info(100, FriendInfoList::new((0..count).map(key).collect()))
    }

    fn kinds(batch: &Batch) -> Vec<WrapperType> {
        batch.wrappers.iter().map(|w| w.kind()).collect()
    }

    const LIMITS: BatchLimits = BatchLimits {
        max_wrappers: 8,
        max_bytes: 1000,
    };

    #[test]
    fn test_salts() {
        let a = key(0xAA);
        let b = key(0xBB);
        let salt = direct_salt(&a, &b, 7);
        assert_eq!(&salt[..4], &[0xAA; 4]);
        assert_eq!(&salt[4..8], &[0xBB; 4]);
        assert_eq!(&salt[8..], &7u64.to_be_bytes());

        // What A publishes for B is what B polls from A.
        assert_eq!(
            PublishTarget::Direct(b).salt(&a, 7),
            PollTarget::Direct(a).salt(&b, 7)
        );
        assert_eq!(PublishTarget::SelfSync.salt(&a, 7), PollTarget::SelfSync.salt(&a, 7));
        assert_eq!(gossip_salt(1), b"gossip\0\0\0\0\0\0\0\x01".to_vec());
    }

    #[test]
    fn test_epoch_boundaries() {
        assert_eq!(epoch(59_999, 60_000), 0);
        assert_eq!(epoch(60_000, 60_000), 1);
        assert_eq!(epoch(5, 0), 5);
    }

    #[test]
    fn test_everything_fits_in_output_order() {
        let batch = build_batch(vec![messages(2, 10), friends(2), signal()], LIMITS).unwrap();
        assert_eq!(
            kinds(&batch),
            vec![
                WrapperType::NewMsgSignal,
                WrapperType::FriendInfoList,
                WrapperType::MessageList
            ]
        );
    }

    #[test]
    fn test_truncates_newest_messages_and_skips_friend_info() {
        let batch = build_batch(vec![signal(), messages(20, 150), friends(3)], LIMITS).unwrap();
        assert!(batch.encoded_len() <= LIMITS.max_bytes);
        assert_eq!(kinds(&batch), vec![WrapperType::NewMsgSignal, WrapperType::MessageList]);

        let WrapperPayload::Messages(list) = &batch.wrappers[1].payload else {
            panic!("expected message list");
        };
        assert!(!list.is_empty() && list.len() < 20);
        // The oldest entries are the ones kept.
        for (i, entry) in list.entries.iter().enumerate() {
            match entry {
                MessageEntry::Inline(m) => assert_eq!(m.timestamp, i as u64),
                MessageEntry::Reference(_) => panic!("unexpected reference"),
            }
        }
    }

    #[test]
    fn test_wrapper_count_limit() {
        let limits = BatchLimits {
            max_wrappers: 1,
            max_bytes: 1000,
        };
        let batch = build_batch(vec![friends(1), messages(1, 1), signal()], limits).unwrap();
        assert_eq!(kinds(&batch), vec![WrapperType::NewMsgSignal]);
    }

    #[test]
    fn test_signal_sheds_gossip() {
        let mut s = NewMsgSignal::new(DeviceId::from_bytes([9; 16]));
        s.gossip = (0..100)
            .map(|i| GossipItem::new(ShortAddress([1; 4]), ShortAddress([2; 4]), i))
            .collect();
        let limits = BatchLimits {
            max_wrappers: 8,
            max_bytes: 300,
        };

        let batch = build_batch(vec![MutableDataWrapper::signal(1, s)], limits).unwrap();
        let (_, kept) = batch.signal().unwrap();
        assert!(!kept.gossip.is_empty() && kept.gossip.len() < 100);
        assert_eq!(kept.gossip[0].timestamp, 0);
        assert!(batch.encoded_len() <= 300);
    }

    #[test]
    fn test_signal_too_large() {
        let mut s = NewMsgSignal::new(DeviceId::from_bytes([9; 16]));
        s.hash_prefixes = vec![7; 2000];
        let result = build_batch(vec![MutableDataWrapper::signal(1, s)], LIMITS);
        assert!(matches!(result, Err(SyncError::PayloadTooLarge { limit: 1000, .. })));
    }

    proptest! {
        #[test]
        fn prop_batch_respects_limits(
            count in 0usize..40,
            payload in 0usize..300,
            friend_count in 0u8..40,
            max_wrappers in 1usize..4,
        ) {
            let limits = BatchLimits { max_wrappers, max_bytes: 1000 };
            let batch = build_batch(
                vec![friends(friend_count), messages(count, payload), signal()],
                limits,
            ).unwrap();

            prop_assert!(batch.encoded_len() <= limits.max_bytes);
            prop_assert!(batch.len() <= max_wrappers);
            prop_assert_eq!(batch.wrappers[0].kind(), WrapperType::NewMsgSignal);
            prop_assert!(batch.wrappers.iter().all(|w| !w.is_empty()));
        }
    }
}
