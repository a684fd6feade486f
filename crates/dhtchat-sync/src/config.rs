//! Engine configuration.
//!
//! Every knob has a default matching the reference deployment. Durations are
//! (de)serialized as integer milliseconds so configs stay hand-editable JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Probabilities for the peer-selection cascade.
///
/// Each stage is tried in order with its probability; a stage that is skipped
/// or has no eligible peer falls through to the next.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionWeights {
    pub chatting: f64,
    pub referral: f64,
    pub recently_active: f64,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            chatting: 0.9,
            referral: 0.7,
            recently_active: 0.5,
        }
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Shortest pause between ticks, unless the repository overrides it.
    #[serde(with = "duration_ms")]
    pub min_loop_interval: Duration,
    /// Longest pause between ticks under back-pressure.
    #[serde(with = "duration_ms")]
    pub max_loop_interval: Duration,
    /// Queue occupation ratio above which the engine slows down and holds requests.
    pub queue_threshold: f64,
    /// Minimum time between two polls of the same channel owner.
    #[serde(with = "duration_ms")]
    pub poll_cooldown: Duration,
    /// Length of one channel epoch; salts rotate at every boundary.
    #[serde(with = "duration_ms")]
    pub time_slice: Duration,
    /// How often the gossip channel is republished.
    #[serde(with = "duration_ms")]
    pub gossip_interval: Duration,
    /// Gossip pairs older than this are forgotten.
    #[serde(with = "duration_ms")]
    pub gossip_horizon: Duration,
    /// Gossip items carried in one signal.
    pub gossip_per_signal: usize,
    /// Messages per peer considered for reconciliation.
    pub window_size: usize,
    /// Ceiling on one encoded DHT item.
    pub item_size_limit: usize,
    /// Wrappers allowed in one batch.
    pub max_wrappers_per_put: usize,
    /// Messages larger than this are published as immutable items and referenced.
    pub inline_message_limit: usize,
    /// Capacity of the engine's own outbound request queue.
    pub outbound_queue_capacity: usize,
    /// Capacity of the command queue between callers and the engine.
    pub command_queue_capacity: usize,
    /// Signal digests remembered for deduplication.
    pub seen_signal_capacity: usize,
    /// A peer seen within this window is "recently active".
    #[serde(with = "duration_ms")]
    pub recently_active_window: Duration,
    /// A chatting peer whose signal is this fresh is treated as writing.
    #[serde(with = "duration_ms")]
    pub writing_window: Duration,
    /// Delay before re-requesting a referenced message that was not found.
    #[serde(with = "duration_ms")]
    pub demand_retry_interval: Duration,
    /// Fetches of one referenced message before it is given up.
    pub max_demand_attempts: u32,
    pub weights: SelectionWeights,
    /// Publish and poll the self channel for multi-device support.
    pub self_sync: bool,
    /// Seed for peer selection; random when absent.
    pub rng_seed: Option<u64>,
    /// Size in bytes of the friend digest Bloom filter.
    pub bloom_bytes: usize,
    pub bloom_hashes: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_loop_interval: Duration::from_millis(50),
            max_loop_interval: Duration::from_secs(10),
            queue_threshold: 0.8,
            poll_cooldown: Duration::from_secs(1),
            time_slice: Duration::from_secs(60),
            gossip_interval: Duration::from_secs(10),
            gossip_horizon: Duration::from_secs(24 * 60 * 60),
            gossip_per_signal: 8,
            window_size: 256,
            item_size_limit: 1000,
            max_wrappers_per_put: 8,
            inline_message_limit: 400,
            outbound_queue_capacity: 1000,
            command_queue_capacity: 256,
            seen_signal_capacity: 512,
            recently_active_window: Duration::from_secs(5 * 60),
            writing_window: Duration::from_secs(10),
            demand_retry_interval: Duration::from_secs(5),
            max_demand_attempts: 12,
            weights: SelectionWeights::default(),
            self_sync: true,
            rng_seed: None,
            bloom_bytes: 64,
            bloom_hashes: 4,
        }
    }
}

impl EngineConfig {
    /// Configuration suited to deterministic tests: seeded selection, no cooldown.
    pub fn for_testing(seed: u64) -> Self {
        Self {
            poll_cooldown: Duration::ZERO,
            rng_seed: Some(seed),
            ..Self::default()
        }
    }

    /// Time slice in milliseconds, never zero.
    pub(crate) fn time_slice_ms(&self) -> u64 {
        (self.time_slice.as_millis() as u64).max(1)
    }
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.min_loop_interval, Duration::from_millis(50));
        assert_eq!(config.max_loop_interval, Duration::from_secs(10));
        assert_eq!(config.window_size, 256);
        assert_eq!(config.gossip_per_signal, 8);
        assert!(config.self_sync);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"poll_cooldown": 250, "weights": {"chatting": 0.5}}"#)
                .unwrap();
        assert_eq!(config.poll_cooldown, Duration::from_millis(250));
        assert_eq!(config.weights.chatting, 0.5);
        assert_eq!(config.weights.referral, 0.7);
        assert_eq!(config.time_slice, Duration::from_secs(60));
    }

    #[test]
    fn test_json_durations_are_millis() {
        let json = serde_json::to_value(EngineConfig::default()).unwrap();
        assert_eq!(json["min_loop_interval"], 50);
        assert_eq!(json["time_slice"], 60_000);
    }
}
