//! Tick pacing and peer selection.

use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use dhtchat_core::PeerKey;

use crate::channel::PollTarget;
use crate::config::SelectionWeights;
use crate::gossip::ReferralQueue;

/// The phases of one engine tick, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    RefreshFriends,
    SelectPeer,
    Poll,
    DrainCallbacks,
    PublishDue,
    AdjustInterval,
    Sleep,
}

impl fmt::Display for TickPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TickPhase::RefreshFriends => "refresh_friends",
            TickPhase::SelectPeer => "select_peer",
            TickPhase::Poll => "poll",
            TickPhase::DrainCallbacks => "drain_callbacks",
            TickPhase::PublishDue => "publish_due",
            TickPhase::AdjustInterval => "adjust_interval",
            TickPhase::Sleep => "sleep",
        };
        f.write_str(name)
    }
}

/// Fraction of the DHT queue in use. An unbounded queue reads as empty.
pub fn occupation_ratio(occupation: usize, capacity: usize) -> f64 {
    if capacity == 0 {
        return 0.0;
    }
    occupation as f64 / capacity as f64
}

/// Multiplicative back-off for the tick interval.
///
/// Above the threshold the interval doubles up to the cap; otherwise it
/// halves back toward the floor.
#[derive(Debug, Clone)]
pub struct IntervalController {
    floor: Duration,
    cap: Duration,
    threshold: f64,
    current: Duration,
}

impl IntervalController {
    pub fn new(floor: Duration, cap: Duration, threshold: f64) -> Self {
        let cap = cap.max(floor);
        Self {
            floor,
            cap,
            threshold,
            current: floor,
        }
    }

    /// Change the floor, e.g. after a repository override.
    pub fn set_floor(&mut self, floor: Duration) {
        self.floor = floor.min(self.cap);
        if self.current < self.floor {
            self.current = self.floor;
        }
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Whether the queue is calm enough to submit more requests.
    pub fn admits(&self, occupation: usize, capacity: usize) -> bool {
        occupation_ratio(occupation, capacity) <= self.threshold
    }

    /// Update and return the interval for the given queue state.
    pub fn adjust(&mut self, occupation: usize, capacity: usize) -> Duration {
        self.current = if self.admits(occupation, capacity) {
            (self.current / 2).max(self.floor)
        } else {
            (self.current * 2).max(Duration::from_millis(1)).min(self.cap)
        };
        self.current
    }

    /// Drop straight back to the floor.
    pub fn reset(&mut self) -> Duration {
        self.current = self.floor;
        self.current
    }
}

/// Why a peer was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    Chatting,
    Referral,
    RecentlyActive,
    Uniform,
}

/// The channel to poll this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub target: PollTarget,
    pub reason: SelectionReason,
}

/// Everything the selector may choose from.
#[derive(Debug, Clone, Copy)]
pub struct Candidates<'a> {
    pub chatting: Option<PeerKey>,
    pub recently_active: &'a [PeerKey],
    pub friends: &'a [PeerKey],
    /// Whether the self channel takes part in uniform selection.
    pub include_self: bool,
}

/// Weighted random choice of the next channel to poll.
pub struct PeerSelector {
    rng: StdRng,
    weights: SelectionWeights,
}

impl PeerSelector {
    pub fn new(weights: SelectionWeights, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng, weights }
    }

    fn chance(&mut self, p: f64) -> bool {
        if !p.is_finite() || p <= 0.0 {
            return false;
        }
        self.rng.gen_bool(p.min(1.0))
    }

    /// Pick a channel, or `None` if nothing is available.
    ///
    /// `available` reports whether a peer (or the self channel, for `None`)
    /// is out of its poll cooldown. Chatting, referral and recently-active
    /// picks read the peer's direct channel; uniform picks read its gossip
    /// channel.
    pub fn select(
        &mut self,
        candidates: &Candidates<'_>,
        referrals: &mut ReferralQueue,
        available: impl Fn(Option<&PeerKey>) -> bool,
    ) -> Option<Selection> {
        let direct = |peer: PeerKey, reason| Selection {
            target: PollTarget::Direct(peer),
            reason,
        };

        if let Some(peer) = candidates.chatting {
            if available(Some(&peer)) && self.chance(self.weights.chatting) {
                return Some(direct(peer, SelectionReason::Chatting));
            }
        }

        if !referrals.is_empty() && self.chance(self.weights.referral) {
            if let Some(peer) = referrals.pop_where(|p| available(Some(p))) {
                return Some(direct(peer, SelectionReason::Referral));
            }
        }

        let active: Vec<PeerKey> = candidates
            .recently_active
            .iter()
            .filter(|p| available(Some(p)))
            .copied()
            .collect();
        if !active.is_empty() && self.chance(self.weights.recently_active) {
            if let Some(peer) = active.choose(&mut self.rng) {
                return Some(direct(*peer, SelectionReason::RecentlyActive));
            }
        }

        let mut pool: Vec<PollTarget> = candidates
            .friends
            .iter()
            .filter(|p| available(Some(p)))
            .map(|p| PollTarget::Gossip(*p))
            .collect();
        if candidates.include_self && available(None) {
            pool.push(PollTarget::SelfSync);
        }
        pool.choose(&mut self.rng).map(|target| Selection {
            target: *target,
            reason: SelectionReason::Uniform,
        })
    }
}

impl fmt::Debug for PeerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSelector")
            .field("weights", &self.weights)
            .finish()
    }
}
