//! Per-friend presence and poll bookkeeping.

use std::collections::HashMap;

use dhtchat_core::{PeerKey, ShortAddress, Timestamp};

/// What the engine knows about one friend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Friend {
    pub key: PeerKey,
    /// Newest signal timestamp observed from this friend.
    pub last_seen: Timestamp,
    /// When the friend last reported chatting with us; zero if never.
    pub chatting_timestamp: Timestamp,
    /// The friend is not polled again before this time.
    pub delay_until: Timestamp,
}

impl Friend {
    fn new(key: PeerKey) -> Self {
        Self {
            key,
            last_seen: 0,
            chatting_timestamp: 0,
            delay_until: 0,
        }
    }
}

/// Changes applied by [`PresenceTracker::sync_friends`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FriendDiff {
    pub added: Vec<PeerKey>,
    pub removed: Vec<PeerKey>,
}

impl FriendDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Tracks friends in repository order, their presence and their cooldowns.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    friends: HashMap<PeerKey, Friend>,
    order: Vec<PeerKey>,
    /// Presence transitions not yet reported, in the order they happened.
    pending: Vec<(PeerKey, Timestamp)>,
    self_delay_until: Timestamp,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the tracked set in line with the repository's friend list.
    ///
    /// State for friends that remain is preserved.
    pub fn sync_friends(&mut self, listed: &[PeerKey]) -> FriendDiff {
        let mut diff = FriendDiff::default();

        for key in listed {
            if !self.friends.contains_key(key) {
                self.friends.insert(*key, Friend::new(*key));
                diff.added.push(*key);
            }
        }

        let keep: std::collections::HashSet<&PeerKey> = listed.iter().collect();
        self.friends.retain(|key, _| {
            let kept = keep.contains(key);
            if !kept {
                diff.removed.push(*key);
            }
            kept
        });
        self.pending.retain(|(key, _)| keep.contains(key));

        self.order.clear();
        for key in listed {
            if !self.order.contains(key) {
                self.order.push(*key);
            }
        }
        diff
    }

    pub fn get(&self, key: &PeerKey) -> Option<&Friend> {
        self.friends.get(key)
    }

    pub fn is_friend(&self, key: &PeerKey) -> bool {
        self.friends.contains_key(key)
    }

    /// Friends in repository order.
    pub fn keys(&self) -> &[PeerKey] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The first friend, in repository order, whose key starts with `short`.
    pub fn resolve(&self, short: &ShortAddress) -> Option<PeerKey> {
        self.order.iter().find(|key| short.matches(key)).copied()
    }

    /// Record a signal timestamp from `peer`.
    ///
    /// Returns `true` and queues one notification when the timestamp is
    /// strictly newer than anything seen before. Every accepted transition is
    /// reported, even when several land before the next drain. Unknown peers
    /// are ignored.
    pub fn record_presence(&mut self, peer: &PeerKey, timestamp: Timestamp) -> bool {
        let Some(friend) = self.friends.get_mut(peer) else {
            return false;
        };
        if timestamp <= friend.last_seen {
            return false;
        }
        friend.last_seen = timestamp;
        self.pending.push((*peer, timestamp));
        true
    }

    /// Drain presence transitions for the listener.
    pub fn take_notifications(&mut self) -> Vec<(PeerKey, Timestamp)> {
        std::mem::take(&mut self.pending)
    }

    /// Keep the newest chatting timestamp a friend reported.
    pub fn set_chatting(&mut self, peer: &PeerKey, timestamp: Timestamp) {
        if let Some(friend) = self.friends.get_mut(peer) {
            friend.chatting_timestamp = friend.chatting_timestamp.max(timestamp);
        }
    }

    /// Start a cooldown for `peer`, or for the self channel when `None`.
    pub fn mark_polled(&mut self, peer: Option<&PeerKey>, until: Timestamp) {
        match peer {
            Some(peer) => {
                if let Some(friend) = self.friends.get_mut(peer) {
                    friend.delay_until = until;
                }
            }
            None => self.self_delay_until = until,
        }
    }

    /// Whether polling `peer` (or the self channel, for `None`) must wait.
    pub fn is_cooling_down(&self, peer: Option<&PeerKey>, now: Timestamp) -> bool {
        let until = match peer {
            Some(peer) => match self.friends.get(peer) {
                Some(friend) => friend.delay_until,
                None => return true,
            },
            None => self.self_delay_until,
        };
        now < until
    }

    /// Friends whose last signal is within `window_ms` of `now`.
    pub fn recently_active(&self, now: Timestamp, window_ms: u64) -> Vec<PeerKey> {
        self.order
            .iter()
            .filter(|key| {
                self.friends
                    .get(*key)
                    .map(|f| f.last_seen > 0 && now.saturating_sub(f.last_seen) <= window_ms)
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    /// Forget everything, as after an identity rotation.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
