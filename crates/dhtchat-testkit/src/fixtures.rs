//! Test fixtures and helpers.
//!
//! Common setup code for multi-party engine tests.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use dhtchat_core::{DeviceId, Keypair, Message, PeerKey, Timestamp};
use dhtchat_store::{MemoryRepository, Repository, Result};
use dhtchat_sync::{
    ChannelListener, Engine, EngineConfig, Event, KeyManager, ManualClock, MemoryDht,
};

/// A fixed, realistic starting time for manual clocks.
pub const TEST_EPOCH_MS: Timestamp = 1_700_000_000_000;

/// An engine wired to in-memory collaborators.
pub type TestEngine = Engine<MemoryRepository, Arc<MemoryDht>>;

/// One participant: an identity, a device and a repository.
pub struct Party {
    pub keypair: Keypair,
    pub device_id: DeviceId,
    pub repo: Arc<MemoryRepository>,
}

impl Party {
    /// Create a party with a deterministic keypair and device id.
    pub fn with_seed(seed: u8) -> Self {
        Self {
            keypair: Keypair::from_seed(&[seed; 32]),
            device_id: DeviceId::from_bytes([seed; 16]),
            repo: Arc::new(MemoryRepository::new()),
        }
    }

    /// A second installation of the same identity, with its own repository.
    pub fn other_device(&self, device: u8) -> Self {
        Self {
            keypair: self.keypair.clone(),
            device_id: DeviceId::from_bytes([device; 16]),
            repo: Arc::new(MemoryRepository::new()),
        }
    }

    pub fn public_key(&self) -> PeerKey {
        self.keypair.public_key()
    }

    /// A message from this party to `peer`.
    pub fn message_to(&self, peer: &PeerKey, timestamp: Timestamp, payload: &[u8]) -> Message {
        Message::new(self.public_key(), *peer, timestamp, payload.to_vec())
    }

    /// Build an engine for this party, returning its event stream too.
    pub fn engine(
        &self,
        dht: &Arc<MemoryDht>,
        clock: &Arc<ManualClock>,
        config: EngineConfig,
    ) -> (TestEngine, UnboundedReceiver<Event>) {
        let keys = KeyManager::new(self.keypair.clone());
        let (listener, events) = ChannelListener::new();
        let engine = Engine::new(
            config,
            self.repo.clone(),
            dht.clone(),
            &keys,
            Arc::new(listener),
            clock.clone(),
            self.device_id,
        );
        (engine, events)
    }
}

/// Create multiple parties with distinct seeds, starting at 1.
pub fn multi_party(count: usize) -> Vec<Party> {
    (0..count).map(|i| Party::with_seed(i as u8 + 1)).collect()
}

/// Make every party a friend of every other.
pub async fn befriend_all(parties: &[Party]) -> Result<()> {
    for a in parties {
        for b in parties {
            if a.public_key() != b.public_key() {
                a.repo.add_friend(&b.public_key()).await?;
            }
        }
    }
    Ok(())
}

/// An alternating conversation of `count` messages, one millisecond apart.
pub fn conversation(a: &Party, b: &Party, count: usize, start: Timestamp) -> Vec<Message> {
    (0..count)
        .map(|i| {
            let ts = start + i as u64;
            let text = format!("message {}", i);
            if i % 2 == 0 {
                a.message_to(&b.public_key(), ts, text.as_bytes())
            } else {
                b.message_to(&a.public_key(), ts, text.as_bytes())
            }
        })
        .collect()
}

/// Store `messages` in `party`'s repository under `peer`.
pub async fn seed_messages(party: &Party, peer: &PeerKey, messages: &[Message]) -> Result<()> {
    for message in messages {
        party.repo.save_message(peer, message).await?;
    }
    Ok(())
}

/// A manual clock at [`TEST_EPOCH_MS`].
pub fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(TEST_EPOCH_MS))
}

/// Drain every event currently queued.
pub fn drain_events(events: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}
