//! Identity provision and key rotation.
//!
//! The engine never owns the signing key outright. It reads the current
//! keypair from an [`IdentityProvider`] and watches for rotations; when the
//! key changes, every per-identity cache is discarded.

use tokio::sync::watch;

use dhtchat_core::{Keypair, PeerKey};

/// Source of the node's current signing identity.
pub trait IdentityProvider: Send + Sync {
    /// The keypair in effect right now.
    fn current(&self) -> Keypair;

    /// A receiver that observes every rotation.
    fn subscribe(&self) -> watch::Receiver<Keypair>;
}

/// Holds the active keypair and broadcasts rotations.
pub struct KeyManager {
    tx: watch::Sender<Keypair>,
}

impl KeyManager {
    pub fn new(keypair: Keypair) -> Self {
        let (tx, _rx) = watch::channel(keypair);
        Self { tx }
    }

    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self::new(Keypair::generate())
    }

    pub fn public_key(&self) -> PeerKey {
        self.tx.borrow().public_key()
    }

    /// Replace the active keypair. Subscribers see the change on their next check.
    pub fn rotate(&self, keypair: Keypair) {
        tracing::info!(new_key = %keypair.public_key(), "rotating identity");
        self.tx.send_replace(keypair);
    }
}

impl IdentityProvider for KeyManager {
    fn current(&self) -> Keypair {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Keypair> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyManager({:?})", self.public_key())
    }
}
