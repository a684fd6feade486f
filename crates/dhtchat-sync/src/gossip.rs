//! Gossip bookkeeping: who talked to whom, referrals, and signal dedup.
//!
//! Gossip items name peers only by short address, so everything here is
//! resolved against the current friend set before it influences polling.

use std::collections::{HashMap, HashSet, VecDeque};

use dhtchat_core::{GossipItem, GossipStatus, PeerKey, ShortAddress, Timestamp};

use crate::presence::PresenceTracker;

/// How a gossip item reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Embedded in a signal published and signed by this peer.
    Direct(PeerKey),
    /// Passed along by a third party.
    Relayed,
}

impl Origin {
    /// Origin of `item` found in a signal signed by `publisher`: direct only
    /// when the publisher is the sender the item names.
    pub fn of(item: &GossipItem, publisher: &PeerKey) -> Self {
        if item.sender.matches(publisher) {
            Origin::Direct(*publisher)
        } else {
            Origin::Relayed
        }
    }
}

/// What [`GossipBook::observe`] did with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The item describes our own activity.
    OwnItem,
    /// `peer` has something for us and should be polled soon.
    Referral { peer: PeerKey, writing: bool },
    /// Stored for forwarding to the friend it is addressed to.
    Recorded,
    /// Nothing we can act on.
    Dropped,
}

/// Observed (sender, receiver) pairs, newest timestamp per pair.
#[derive(Debug, Default)]
pub struct GossipBook {
    pairs: HashMap<(ShortAddress, ShortAddress), GossipItem>,
    broadcast_cursor: usize,
}

impl GossipBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify and absorb one gossip item.
    ///
    /// Items about us are trusted as-is only when the publisher is the named
    /// sender. A relayed item about us still counts if it names a friend and
    /// is newer than that friend's last signal.
    pub fn observe(
        &mut self,
        item: &GossipItem,
        origin: Origin,
        me: &PeerKey,
        friends: &PresenceTracker,
    ) -> Observation {
        if item.sender.matches(me) {
            return Observation::OwnItem;
        }

        if item.receiver.matches(me) {
            if let Origin::Direct(publisher) = origin {
                if item.sender.matches(&publisher) && friends.is_friend(&publisher) {
                    return Observation::Referral {
                        peer: publisher,
                        writing: item.status == GossipStatus::OnWriting,
                    };
                }
            }
            return match friends.resolve(&item.sender) {
                Some(peer)
                    if friends
                        .get(&peer)
                        .map(|f| item.timestamp > f.last_seen)
                        .unwrap_or(false) =>
                {
                    Observation::Referral {
                        peer,
                        writing: false,
                    }
                }
                _ => Observation::Dropped,
            };
        }

        if friends.resolve(&item.receiver).is_some() {
            self.record(item);
            return Observation::Recorded;
        }
        Observation::Dropped
    }

    fn record(&mut self, item: &GossipItem) {
        let entry = self.pairs.entry(item.pair()).or_insert(*item);
        if item.timestamp > entry.timestamp {
            *entry = *item;
        }
    }

    /// The newest timestamp recorded for a pair.
    pub fn latest(&self, sender: ShortAddress, receiver: ShortAddress) -> Option<Timestamp> {
        self.pairs.get(&(sender, receiver)).map(|i| i.timestamp)
    }

    /// Drop pairs older than `horizon_ms`. Returns how many were removed.
    pub fn prune(&mut self, now: Timestamp, horizon_ms: u64) -> usize {
        let before = self.pairs.len();
        self.pairs
            .retain(|_, item| item.timestamp.saturating_add(horizon_ms) >= now);
        before - self.pairs.len()
    }

    /// Drop every pair that mentions `peer`.
    pub fn forget_peer(&mut self, peer: &PeerKey) {
        self.pairs
            .retain(|(sender, receiver), _| !sender.matches(peer) && !receiver.matches(peer));
    }

    fn newest_first(&self) -> Vec<GossipItem> {
        let mut items: Vec<GossipItem> = self.pairs.values().copied().collect();
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.pair().cmp(&b.pair())));
        items
    }

    /// Up to `limit` items for the signal addressed to `peer`.
    ///
    /// Our own item for the peer comes first, then pairs addressed to the
    /// peer, then the rest, each group newest first. Items the peer itself
    /// sent are left out.
    pub fn for_peer(
        &self,
        peer: &PeerKey,
        own: Option<GossipItem>,
        limit: usize,
    ) -> Vec<GossipItem> {
        let (to_peer, others): (Vec<GossipItem>, Vec<GossipItem>) = self
            .newest_first()
            .into_iter()
            .filter(|item| !item.sender.matches(peer))
            .partition(|item| item.receiver.matches(peer));

        own.into_iter()
            .chain(to_peer)
            .chain(others)
            .take(limit)
            .collect()
    }

    /// Up to `limit` items for the public gossip channel.
    ///
    /// When there is more than fits, successive calls rotate through the
    /// backlog so every pair is eventually broadcast.
    pub fn broadcast(&mut self, own: Vec<GossipItem>, limit: usize) -> Vec<GossipItem> {
        let mut all = own;
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        all.extend(self.newest_first());

        if all.len() <= limit {
            return all;
        }
        let start = self.broadcast_cursor % all.len();
        self.broadcast_cursor = start + limit;
        all.iter().cycle().skip(start).take(limit).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Peers to poll soon, in order, without duplicates.
#[derive(Debug, Default)]
pub struct ReferralQueue {
    queue: VecDeque<PeerKey>,
    members: HashSet<PeerKey>,
}

impl ReferralQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `peer`. Writing peers jump to the front.
    pub fn push(&mut self, peer: PeerKey, writing: bool) {
        if writing {
            if self.members.contains(&peer) {
                self.queue.retain(|p| p != &peer);
            }
            self.queue.push_front(peer);
            self.members.insert(peer);
        } else if self.members.insert(peer) {
            self.queue.push_back(peer);
        }
    }

    /// Remove and return the first peer accepted by `eligible`.
    pub fn pop_where(&mut self, eligible: impl Fn(&PeerKey) -> bool) -> Option<PeerKey> {
        let index = self.queue.iter().position(|p| eligible(p))?;
        let peer = self.queue.remove(index)?;
        self.members.remove(&peer);
        Some(peer)
    }

    pub fn remove(&mut self, peer: &PeerKey) {
        if self.members.remove(peer) {
            self.queue.retain(|p| p != peer);
        }
    }

    pub fn contains(&self, peer: &PeerKey) -> bool {
        self.members.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.members.clear();
    }
}

/// Fixed-size memory of processed signal digests.
#[derive(Debug)]
pub struct SeenSignals {
    ring: VecDeque<[u8; 32]>,
    set: HashSet<[u8; 32]>,
    capacity: usize,
}

impl SeenSignals {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity),
            set: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Remember `digest`. Returns `false` if it was already known.
    pub fn insert(&mut self, digest: [u8; 32]) -> bool {
        if !self.set.insert(digest) {
            return false;
        }
        self.ring.push_back(digest);
        if self.ring.len() > self.capacity {
            if let Some(evicted) = self.ring.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn clear(&mut self) {
        self.ring.clear();
        self.set.clear();
    }
}
