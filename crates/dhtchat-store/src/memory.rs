//! In-memory implementation of the Repository trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use dhtchat_core::{Message, MessageHash, PeerKey};

use crate::error::{Result, StoreError};
use crate::traits::{sort_chronologically, InsertResult, Repository};

/// In-memory repository implementation.
///
/// All data is lost when the repository is dropped. Thread-safe via RwLock.
pub struct MemoryRepository {
    inner: RwLock<MemoryRepositoryInner>,
}

#[derive(Default)]
struct MemoryRepositoryInner {
    /// Friends in insertion order.
    friends: Vec<PeerKey>,

    /// Messages indexed by hash.
    messages: HashMap<MessageHash, Message>,

    /// Conversation index: peer -> message hashes.
    conversations: HashMap<PeerKey, Vec<MessageHash>>,

    chatting_friend: Option<PeerKey>,

    settings: HashMap<String, String>,
}

impl MemoryRepository {
    /// Create a new empty in-memory repository.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryRepositoryInner::default()),
        }
    }

    /// Create a repository pre-populated with friends.
    pub fn with_friends(friends: impl IntoIterator<Item = PeerKey>) -> Self {
        let repo = Self::new();
        if let Ok(mut inner) = repo.inner.write() {
            for friend in friends {
                if !inner.friends.contains(&friend) {
                    inner.friends.push(friend);
                }
            }
        }
        repo
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryRepositoryInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryRepositoryInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn list_friends(&self) -> Result<Vec<PeerKey>> {
        Ok(self.read()?.friends.clone())
    }

    async fn add_friend(&self, key: &PeerKey) -> Result<bool> {
        let mut inner = self.write()?;
        if inner.friends.contains(key) {
            return Ok(false);
        }
        inner.friends.push(*key);
        Ok(true)
    }

    async fn remove_friend(&self, key: &PeerKey) -> Result<bool> {
        let mut inner = self.write()?;
        let before = inner.friends.len();
        inner.friends.retain(|f| f != key);
        if inner.chatting_friend.as_ref() == Some(key) {
            inner.chatting_friend = None;
        }
        Ok(inner.friends.len() != before)
    }

    async fn save_message(&self, peer: &PeerKey, message: &Message) -> Result<InsertResult> {
        let hash = message.hash();
        let mut inner = self.write()?;

        if inner.messages.contains_key(&hash) {
            return Ok(InsertResult::AlreadyExists);
        }

        inner.messages.insert(hash, message.clone());
        inner.conversations.entry(*peer).or_default().push(hash);
        Ok(InsertResult::Inserted)
    }

    async fn get_message(&self, hash: &MessageHash) -> Result<Option<Message>> {
        Ok(self.read()?.messages.get(hash).cloned())
    }

    async fn has_message(&self, hash: &MessageHash) -> Result<bool> {
        Ok(self.read()?.messages.contains_key(hash))
    }

    async fn latest_messages(&self, peer: &PeerKey, limit: usize) -> Result<Vec<Message>> {
        let inner = self.read()?;
        let Some(hashes) = inner.conversations.get(peer) else {
            return Ok(Vec::new());
        };

        let mut messages: Vec<(MessageHash, Message)> = hashes
            .iter()
            .filter_map(|h| inner.messages.get(h).map(|m| (*h, m.clone())))
            .collect();
        sort_chronologically(&mut messages);

        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).map(|(_, m)| m).collect())
    }

    async fn chatting_friend(&self) -> Result<Option<PeerKey>> {
        Ok(self.read()?.chatting_friend)
    }

    async fn set_chatting_friend(&self, peer: Option<&PeerKey>) -> Result<()> {
        self.write()?.chatting_friend = peer.copied();
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read()?.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.write()?
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
