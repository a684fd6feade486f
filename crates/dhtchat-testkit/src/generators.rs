//! Proptest generators for property-based testing.

use proptest::prelude::*;

use dhtchat_core::{
    GossipItem, GossipStatus, Keypair, Message, MessageHash, PeerKey, ShortAddress, Timestamp,
};

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// Generate a valid public key.
pub fn peer_key() -> impl Strategy<Value = PeerKey> {
    keypair().prop_map(|kp| kp.public_key())
}

pub fn message_hash() -> impl Strategy<Value = MessageHash> {
    any::<[u8; 32]>().prop_map(MessageHash::from_bytes)
}

pub fn short_address() -> impl Strategy<Value = ShortAddress> {
    any::<[u8; 4]>().prop_map(ShortAddress::from_bytes)
}

/// Generate a reasonable timestamp.
pub fn timestamp() -> impl Strategy<Value = Timestamp> {
    0u64..=1_700_000_000_000u64
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

pub fn gossip_status() -> impl Strategy<Value = GossipStatus> {
    prop_oneof![Just(GossipStatus::Unknown), Just(GossipStatus::OnWriting)]
}

pub fn gossip_item() -> impl Strategy<Value = GossipItem> {
    (short_address(), short_address(), timestamp(), gossip_status())
        .prop_map(|(s, r, ts, status)| GossipItem::new(s, r, ts).with_status(status))
}

/// A message between two fixed peers.
pub fn message_between(sender: PeerKey, receiver: PeerKey) -> impl Strategy<Value = Message> {
    (timestamp(), payload(200))
        .prop_map(move |(ts, payload)| Message::new(sender, receiver, ts, payload))
}

/// A conversation window, oldest first.
pub fn window(
    sender: PeerKey,
    receiver: PeerKey,
    max_len: usize,
) -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec(message_between(sender, receiver), 0..=max_len).prop_map(
        |mut messages| {
            messages.sort_by_key(|m| m.timestamp);
            messages
        },
    )
}

/// A prefix array and a subsequence of it, as a peer lagging behind would report.
pub fn prefixes_with_subsequence(max_len: usize) -> impl Strategy<Value = (Vec<u8>, Vec<u8>)> {
    prop::collection::vec((any::<u8>(), any::<bool>()), 0..=max_len).prop_map(|pairs| {
        let full = pairs.iter().map(|(b, _)| *b).collect();
        let kept = pairs.iter().filter(|(_, keep)| *keep).map(|(b, _)| *b).collect();
        (full, kept)
    })
}
