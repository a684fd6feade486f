//! Digest reconciliation.
//!
//! Each side publishes one byte per message in its recent window with the
//! other (the first byte of the message hash, oldest first). Aligning the
//! remote prefix array against our own with an edit-distance program tells us
//! two things at once:
//!
//! - **insertions** are local messages the peer does not have yet,
//! - **matching substitutions** are messages the peer has confirmed.
//!
//! Deletions (messages the peer claims that we lack) are ignored here; those
//! arrive through the peer's own message list. A prefix collision can make a
//! missing message look confirmed. That only suppresses a resend, since the
//! full hash is re-checked before anything is stored.

use std::collections::{HashMap, HashSet};

use dhtchat_core::{
    DeviceId, GossipItem, Message, MessageHash, NewMsgSignal, PeerKey, ShortAddress, Timestamp,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Substitute,
    Insert,
    Delete,
}

/// Positions in the target (local) sequence, ascending.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Alignment {
    /// Target positions the source lacks.
    pub missing: Vec<usize>,
    /// Target positions matched byte-for-byte in the source.
    pub confirmed: Vec<usize>,
}

/// Align `source` (what the peer reports) against `target` (what we have).
///
/// Unit costs throughout. Equal-cost choices prefer substitution, then
/// insertion, then deletion.
pub fn align(source: &[u8], target: &[u8]) -> Alignment {
    let rows = source.len() + 1;
    let cols = target.len() + 1;
    let mut cost = vec![0u32; rows * cols];
    let mut ops = vec![Op::Substitute; rows * cols];
    let at = |i: usize, j: usize| i * cols + j;

    for j in 1..cols {
        cost[at(0, j)] = j as u32;
        ops[at(0, j)] = Op::Insert;
    }
    for i in 1..rows {
        cost[at(i, 0)] = i as u32;
        ops[at(i, 0)] = Op::Delete;
    }

    for i in 1..rows {
        for j in 1..cols {
            let mismatch = u32::from(source[i - 1] != target[j - 1]);
            let substitute = cost[at(i - 1, j - 1)] + mismatch;
            let insert = cost[at(i, j - 1)] + 1;
            let delete = cost[at(i - 1, j)] + 1;

            let (best, op) = if substitute <= insert && substitute <= delete {
                (substitute, Op::Substitute)
            } else if insert <= delete {
                (insert, Op::Insert)
            } else {
                (delete, Op::Delete)
            };
            cost[at(i, j)] = best;
            ops[at(i, j)] = op;
        }
    }

    let mut alignment = Alignment::default();
    let (mut i, mut j) = (source.len(), target.len());
    while i > 0 || j > 0 {
        match ops[at(i, j)] {
            Op::Substitute => {
                if source[i - 1] == target[j - 1] {
                    alignment.confirmed.push(j - 1);
                }
                i -= 1;
                j -= 1;
            }
            Op::Insert => {
                alignment.missing.push(j - 1);
                j -= 1;
            }
            Op::Delete => i -= 1,
        }
    }
    alignment.missing.reverse();
    alignment.confirmed.reverse();
    alignment
}

/// One byte per message: the first byte of its hash.
pub fn hash_prefixes(window: &[Message]) -> Vec<u8> {
    window.iter().map(|m| m.hash().prefix()).collect()
}

/// The outcome of reconciling a local window against a remote digest.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Local messages the peer lacks, oldest first.
    pub missing: Vec<Message>,
    /// Hashes of local messages the peer holds.
    pub confirmed: Vec<MessageHash>,
}

/// Reconcile our window with `peer`'s published prefix array.
///
/// An empty remote array marks the whole window missing; an empty window
/// yields nothing.
pub fn reconcile(window: &[Message], remote_prefixes: &[u8]) -> Reconciliation {
    let target = hash_prefixes(window);
    let alignment = align(remote_prefixes, &target);
    Reconciliation {
        missing: alignment
            .missing
            .iter()
            .map(|&i| window[i].clone())
            .collect(),
        confirmed: alignment.confirmed.iter().map(|&i| window[i].hash()).collect(),
    }
}

/// Build the signal addressed to one peer.
pub fn outbound_signal(
    device_id: DeviceId,
    window: &[Message],
    chatting: Option<(ShortAddress, Timestamp)>,
    gossip: Vec<GossipItem>,
) -> NewMsgSignal {
    let mut signal = NewMsgSignal::new(device_id);
    signal.hash_prefixes = hash_prefixes(window);
    if let Some((friend, since)) = chatting {
        signal.chatting_friend = Some(friend);
        signal.chatting_timestamp = since;
    }
    signal.gossip = gossip;
    signal
}

/// Remembers which of our messages each peer has confirmed, so every read
/// receipt is reported once.
#[derive(Debug, Default)]
pub struct ReceiptTracker {
    confirmed: HashMap<PeerKey, HashSet<MessageHash>>,
}

impl ReceiptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `confirmed` for `peer` and return the hashes not seen before.
    ///
    /// Hashes that have left `window` are forgotten.
    pub fn record(
        &mut self,
        peer: &PeerKey,
        confirmed: &[MessageHash],
        window: &[MessageHash],
    ) -> Vec<MessageHash> {
        let known = self.confirmed.entry(*peer).or_default();
        let in_window: HashSet<&MessageHash> = window.iter().collect();
        known.retain(|h| in_window.contains(h));

        confirmed
            .iter()
            .filter(|h| known.insert(**h))
            .copied()
            .collect()
    }

    pub fn forget(&mut self, peer: &PeerKey) {
        self.confirmed.remove(peer);
    }

    pub fn clear(&mut self) {
        self.confirmed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_align_gaps() {
        let alignment = align(&[1, 3, 4], &[1, 2, 3, 4, 5]);
        assert_eq!(alignment.missing, vec![1, 4]);
        assert_eq!(alignment.confirmed, vec![0, 2, 3]);
    }

    #[test]
    fn test_align_empty_inputs() {
        let full = align(&[], &[7, 8, 9]);
        assert_eq!(full.missing, vec![0, 1, 2]);
        assert!(full.confirmed.is_empty());

        let nothing = align(&[7, 8], &[]);
        assert_eq!(nothing, Alignment::default());
    }

    #[test]
    fn test_align_ignores_remote_extras() {
        // The peer holds a message we have not received yet.
        let alignment = align(&[1, 2, 9, 3], &[1, 2, 3]);
        assert!(alignment.missing.is_empty());
        assert_eq!(alignment.confirmed, vec![0, 1, 2]);
    }

    #[test]
    fn test_align_identical() {
        let alignment = align(&[5, 6, 7], &[5, 6, 7]);
        assert!(alignment.missing.is_empty());
        assert_eq!(alignment.confirmed, vec![0, 1, 2]);
    }

    /// Messages with pairwise distinct hash prefixes, so alignments are unambiguous.
    fn window(n: u64) -> Vec<Message> {
        let a = PeerKey::from_bytes([1; 32]);
        let b = PeerKey::from_bytes([2; 32]);
        let mut used = HashSet::new();
        let mut out = Vec::new();
        for ts in 1..=n {
            let mut nonce = 0u32;
            loop {
                let m = Message::new(a, b, ts, format!("m{}-{}", ts, nonce).into_bytes());
                if used.insert(m.hash().prefix()) {
                    out.push(m);
                    break;
                }
                nonce += 1;
            }
        }
        out
    }

    #[test]
    fn test_reconcile_messages() {
        let local = window(5);
        let remote: Vec<u8> = [0usize, 2, 3].iter().map(|&i| local[i].hash().prefix()).collect();

        let result = reconcile(&local, &remote);
        let missing: Vec<u64> = result.missing.iter().map(|m| m.timestamp).collect();
        assert_eq!(missing, vec![2, 5]);
        assert_eq!(
            result.confirmed,
            vec![local[0].hash(), local[2].hash(), local[3].hash()]
        );
    }

    #[test]
    fn test_reconcile_empty_remote_is_full_catch_up() {
        let local = window(3);
        let result = reconcile(&local, &[]);
        assert_eq!(result.missing, local);
        assert!(result.confirmed.is_empty());
        assert_eq!(reconcile(&[], &[1, 2]), Reconciliation::default());
    }

    #[test]
    fn test_outbound_signal() {
        let local = window(2);
        let chatting = ShortAddress::from_bytes([2; 4]);
        let signal = outbound_signal(
            DeviceId::from_bytes([3; 16]),
            &local,
            Some((chatting, 77)),
            Vec::new(),
        );
        assert_eq!(signal.hash_prefixes, hash_prefixes(&local));
        assert_eq!(signal.chatting_friend, Some(chatting));
        assert_eq!(signal.chatting_timestamp, 77);
        assert!(signal.friend_digest.is_none());
    }

    #[test]
    fn test_receipts_reported_once() {
        let peer = PeerKey::from_bytes([2; 32]);
        let h1 = MessageHash::from_bytes([1; 32]);
        let h2 = MessageHash::from_bytes([2; 32]);
        let mut tracker = ReceiptTracker::new();

        assert_eq!(tracker.record(&peer, &[h1], &[h1, h2]), vec![h1]);
        assert_eq!(tracker.record(&peer, &[h1, h2], &[h1, h2]), vec![h2]);
        assert!(tracker.record(&peer, &[h1, h2], &[h1, h2]).is_empty());

        tracker.forget(&peer);
        assert_eq!(tracker.record(&peer, &[h1], &[h1]), vec![h1]);
    }

    proptest! {
        #[test]
        fn prop_subsequence_alignment(
            target in proptest::collection::vec(any::<u8>(), 0..64),
            keep in proptest::collection::vec(any::<bool>(), 64),
        ) {
            let source: Vec<u8> = target
                .iter()
                .zip(keep.iter())
                .filter(|(_, k)| **k)
                .map(|(b, _)| *b)
                .collect();

            let alignment = align(&source, &target);
            prop_assert_eq!(alignment.missing.len(), target.len() - source.len());
            prop_assert_eq!(alignment.confirmed.len(), source.len());

            let mut all: Vec<usize> = alignment
                .missing
                .iter()
                .chain(alignment.confirmed.iter())
                .copied()
                .collect();
            all.sort_unstable();
            prop_assert_eq!(all, (0..target.len()).collect::<Vec<_>>());
            prop_assert!(alignment.missing.windows(2).all(|w| w[0] < w[1]));
        }

        #[test]
        fn prop_align_is_bounded_and_repeatable(
            source in proptest::collection::vec(any::<u8>(), 0..40),
            target in proptest::collection::vec(any::<u8>(), 0..40),
        ) {
            let alignment = align(&source, &target);
            prop_assert!(alignment.missing.len() + alignment.confirmed.len() <= target.len());
            prop_assert!(alignment.missing.iter().all(|&i| i < target.len()));
            prop_assert_eq!(align(&source, &target), alignment);
        }
    }
}
