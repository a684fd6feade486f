//! DHT abstraction for the sync engine.
//!
//! The DHT is an external collaborator with its own worker queue. Requests are
//! submitted fire-and-forget; each carries a typed tag and a [`Completion`]
//! through which the result comes back to the engine's response channel.
//! Completions that arrive after the engine has stopped are silently dropped.

use std::sync::Arc;

use tokio::sync::mpsc;

use dhtchat_core::{CoreError, Keypair, MessageHash, PeerKey, Signature};

use crate::channel::{PollTarget, PublishTarget};

/// A signed, salted, sequence-numbered mutable DHT item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutableItem {
    pub key: PeerKey,
    pub salt: Vec<u8>,
    pub seq: u64,
    pub value: Vec<u8>,
    pub signature: Signature,
}

impl MutableItem {
    pub fn sign(keypair: &Keypair, salt: Vec<u8>, seq: u64, value: Vec<u8>) -> Self {
        let signature = keypair.sign_item(&salt, seq, &value);
        Self {
            key: keypair.public_key(),
            salt,
            seq,
            value,
            signature,
        }
    }

    pub fn verify(&self) -> Result<(), CoreError> {
        self.key
            .verify_item(&self.salt, self.seq, &self.value, &self.signature)
    }
}

/// Correlates a get with what the engine asked for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GetTag {
    /// A channel read, pinned to the epoch whose salt was used.
    Channel { target: PollTarget, epoch: u64 },
    /// A referenced message announced by `peer`.
    Message { peer: PeerKey, hash: MessageHash },
}

/// Correlates a put with what the engine published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutTag {
    Channel(PublishTarget),
    /// One of our own new messages; its outcome is reported to the listener.
    Message { peer: PeerKey, hash: MessageHash },
    /// A re-publish of a message referenced from a message list.
    Reference(MessageHash),
}

/// A request for the DHT worker.
#[derive(Clone, Debug)]
pub enum DhtRequest {
    ImmutableGet {
        hash: MessageHash,
        tag: GetTag,
    },
    MutableGet {
        key: PeerKey,
        salt: Vec<u8>,
        tag: GetTag,
    },
    ImmutablePut {
        value: Vec<u8>,
        tag: PutTag,
    },
    MutablePut {
        item: MutableItem,
        tag: PutTag,
    },
}

impl DhtRequest {
    pub fn is_put(&self) -> bool {
        matches!(
            self,
            DhtRequest::ImmutablePut { .. } | DhtRequest::MutablePut { .. }
        )
    }
}

/// The result of a [`DhtRequest`].
#[derive(Clone, Debug)]
pub enum DhtResponse {
    Immutable {
        tag: GetTag,
        value: Option<Vec<u8>>,
    },
    Mutable {
        tag: GetTag,
        item: Option<MutableItem>,
    },
    Put {
        tag: PutTag,
        success: bool,
    },
}

/// Return path for one request.
#[derive(Clone, Debug)]
pub struct Completion {
    tx: mpsc::UnboundedSender<DhtResponse>,
}

impl Completion {
    pub fn new(tx: mpsc::UnboundedSender<DhtResponse>) -> Self {
        Self { tx }
    }

    /// Deliver the result. A no-op once the engine is gone.
    pub fn complete(self, response: DhtResponse) {
        let _ = self.tx.send(response);
    }
}

/// A DHT node with a bounded request queue.
///
/// Implementations must be thread-safe (Send + Sync). `submit` must not block.
pub trait Dht: Send + Sync {
    fn submit(&self, request: DhtRequest, completion: Completion);

    /// Requests currently queued inside the DHT worker.
    fn queue_occupation(&self) -> usize;

    fn queue_capacity(&self) -> usize;

    /// Largest value the DHT accepts in one item.
    fn item_size_limit(&self) -> usize;
}

impl<T: Dht + ?Sized> Dht for Arc<T> {
    fn submit(&self, request: DhtRequest, completion: Completion) {
        (**self).submit(request, completion)
    }

    fn queue_occupation(&self) -> usize {
        (**self).queue_occupation()
    }

    fn queue_capacity(&self) -> usize {
        (**self).queue_capacity()
    }

    fn item_size_limit(&self) -> usize {
        (**self).item_size_limit()
    }
}

/// A shared in-memory DHT for testing.
///
/// Every node handed the same `Arc<MemoryDht>` sees the same storage.
/// Requests complete synchronously.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Storage {
        immutable: HashMap<MessageHash, Vec<u8>>,
        mutable: HashMap<(PeerKey, Vec<u8>), MutableItem>,
    }

    /// In-memory DHT implementation.
    pub struct MemoryDht {
        storage: Mutex<Storage>,
        capacity: usize,
        item_limit: usize,
        occupation: AtomicUsize,
        fail_puts: AtomicBool,
        requests: AtomicUsize,
    }

    impl MemoryDht {
        /// Create a new memory DHT with a 1000-slot queue and 1000-byte items.
        pub fn new() -> Arc<Self> {
            Self::with_limits(1000, 1000)
        }

        pub fn with_limits(capacity: usize, item_limit: usize) -> Arc<Self> {
            Arc::new(Self {
                storage: Mutex::new(Storage::default()),
                capacity,
                item_limit,
                occupation: AtomicUsize::new(0),
                fail_puts: AtomicBool::new(false),
                requests: AtomicUsize::new(0),
            })
        }

        /// Pretend the worker queue holds `n` requests.
        pub fn set_occupation(&self, n: usize) {
            self.occupation.store(n, Ordering::SeqCst);
        }

        /// Make every subsequent put fail.
        pub fn set_fail_puts(&self, fail: bool) {
            self.fail_puts.store(fail, Ordering::SeqCst);
        }

        /// Total requests submitted so far.
        pub fn request_count(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }

        pub fn get_mutable(&self, key: &PeerKey, salt: &[u8]) -> Option<MutableItem> {
            self.lock().mutable.get(&(*key, salt.to_vec())).cloned()
        }

        pub fn get_immutable(&self, hash: &MessageHash) -> Option<Vec<u8>> {
            self.lock().immutable.get(hash).cloned()
        }

        /// Forget an immutable item, as if it expired from the network.
        pub fn remove_immutable(&self, hash: &MessageHash) -> bool {
            self.lock().immutable.remove(hash).is_some()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Storage> {
            self.storage.lock().unwrap_or_else(|e| e.into_inner())
        }

        fn put_mutable(&self, item: MutableItem) -> bool {
            if item.value.len() > self.item_limit || item.verify().is_err() {
                return false;
            }
            let mut storage = self.lock();
            let slot = (item.key, item.salt.clone());
            match storage.mutable.get(&slot) {
                Some(existing) if existing.seq > item.seq => false,
                _ => {
                    storage.mutable.insert(slot, item);
                    true
                }
            }
        }

        fn put_immutable(&self, value: Vec<u8>) -> bool {
            if value.len() > self.item_limit {
                return false;
            }
            self.lock().immutable.insert(MessageHash::of(&value), value);
            true
        }
    }

    impl Dht for MemoryDht {
        fn submit(&self, request: DhtRequest, completion: Completion) {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let failing = self.fail_puts.load(Ordering::SeqCst);

            let response = match request {
                DhtRequest::ImmutableGet { hash, tag } => DhtResponse::Immutable {
                    tag,
                    value: self.get_immutable(&hash),
                },
                DhtRequest::MutableGet { key, salt, tag } => DhtResponse::Mutable {
                    tag,
                    item: self.get_mutable(&key, &salt),
                },
                DhtRequest::ImmutablePut { value, tag } => DhtResponse::Put {
                    tag,
                    success: !failing && self.put_immutable(value),
                },
                DhtRequest::MutablePut { item, tag } => DhtResponse::Put {
                    tag,
                    success: !failing && self.put_mutable(item),
                },
            };
            completion.complete(response);
        }

        fn queue_occupation(&self) -> usize {
            self.occupation.load(Ordering::SeqCst)
        }

        fn queue_capacity(&self) -> usize {
            self.capacity
        }

        fn item_size_limit(&self) -> usize {
            self.item_limit
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryDht;
    use super::*;

    fn completion() -> (Completion, mpsc::UnboundedReceiver<DhtResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Completion::new(tx), rx)
    }

    #[test]
    fn test_mutable_item_signature() {
        let keypair = Keypair::from_seed(&[3; 32]);
        let item = MutableItem::sign(&keypair, b"salt".to_vec(), 5, b"value".to_vec());
        assert!(item.verify().is_ok());

        let mut forged = item.clone();
        forged.seq = 6;
        assert!(forged.verify().is_err());
    }

    #[tokio::test]
    async fn test_memory_dht_mutable_roundtrip() {
        let dht = MemoryDht::new();
        let keypair = Keypair::from_seed(&[1; 32]);
        let item = MutableItem::sign(&keypair, b"s".to_vec(), 10, b"v1".to_vec());
        let tag = PutTag::Channel(PublishTarget::Gossip);

        let (c, mut rx) = completion();
        dht.submit(DhtRequest::MutablePut { item: item.clone(), tag: tag.clone() }, c);
        assert!(matches!(rx.recv().await, Some(DhtResponse::Put { success: true, .. })));

        // Older sequence numbers are rejected.
        let stale = MutableItem::sign(&keypair, b"s".to_vec(), 9, b"v0".to_vec());
        let (c, mut rx) = completion();
        dht.submit(DhtRequest::MutablePut { item: stale, tag }, c);
        assert!(matches!(rx.recv().await, Some(DhtResponse::Put { success: false, .. })));

        let get_tag = GetTag::Channel {
            target: PollTarget::Gossip(keypair.public_key()),
            epoch: 0,
        };
        let (c, mut rx) = completion();
        dht.submit(
            DhtRequest::MutableGet {
                key: keypair.public_key(),
                salt: b"s".to_vec(),
                tag: get_tag,
            },
            c,
        );
        match rx.recv().await {
            Some(DhtResponse::Mutable { item: Some(got), .. }) => assert_eq!(got, item),
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(dht.request_count(), 3);
    }

    #[tokio::test]
    async fn test_memory_dht_rejects_forged_and_oversized() {
        let dht = MemoryDht::with_limits(10, 8);
        let keypair = Keypair::from_seed(&[1; 32]);

        let mut forged = MutableItem::sign(&keypair, vec![], 1, b"ok".to_vec());
        forged.value = b"no".to_vec();
        assert!(!dht.put_mutable_for_test(forged));

        let (c, mut rx) = completion();
        dht.submit(
            DhtRequest::ImmutablePut {
                value: vec![0; 9],
                tag: PutTag::Reference(MessageHash::from_bytes([0; 32])),
            },
            c,
        );
        assert!(matches!(rx.recv().await, Some(DhtResponse::Put { success: false, .. })));
    }

    #[tokio::test]
    async fn test_completion_after_receiver_dropped() {
        let dht = MemoryDht::new();
        let (c, rx) = completion();
        drop(rx);
        dht.submit(
            DhtRequest::ImmutableGet {
                hash: MessageHash::from_bytes([1; 32]),
                tag: GetTag::Message {
                    peer: PeerKey::from_bytes([2; 32]),
                    hash: MessageHash::from_bytes([1; 32]),
                },
            },
            c,
        );
    }

    impl MemoryDht {
        fn put_mutable_for_test(&self, item: MutableItem) -> bool {
            let (c, mut rx) = completion();
            self.submit(
                DhtRequest::MutablePut {
                    item,
                    tag: PutTag::Channel(PublishTarget::SelfSync),
                },
                c,
            );
            matches!(rx.try_recv(), Ok(DhtResponse::Put { success: true, .. }))
        }
    }
}
