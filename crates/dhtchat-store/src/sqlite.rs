//! SQLite implementation of the Repository trait.
//!
//! This is the primary storage backend for dhtchat. It uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use dhtchat_core::{Canonical, Message, MessageHash, PeerKey};

use crate::error::{Result, StoreError};
use crate::migration::{self, now_millis};
use crate::traits::{InsertResult, Repository};

/// Settings key holding the hex-encoded chatting friend.
const CHATTING_FRIEND_KEY: &str = "chatting_friend";

/// SQLite-based repository implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking operation on the connection off the async runtime.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn blob_to_key(bytes: Vec<u8>) -> Result<PeerKey> {
    PeerKey::try_from(bytes.as_slice())
        .map_err(|_| StoreError::InvalidData(format!("peer key of {} bytes", bytes.len())))
}

fn decode_message(bytes: &[u8]) -> Result<Message> {
    Ok(Message::from_canonical_bytes(bytes)?)
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn list_friends(&self) -> Result<Vec<PeerKey>> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT peer_key FROM friends ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(blob_to_key).collect()
        })
        .await
    }

    async fn add_friend(&self, key: &PeerKey) -> Result<bool> {
        let key = *key;
        self.run(move |conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO friends (peer_key, added_at) VALUES (?1, ?2)",
                params![key.as_bytes().as_slice(), now_millis()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn remove_friend(&self, key: &PeerKey) -> Result<bool> {
        let key = *key;
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "DELETE FROM friends WHERE peer_key = ?1",
                params![key.as_bytes().as_slice()],
            )?;
            tx.execute(
                "DELETE FROM settings WHERE key = ?1 AND value = ?2",
                params![CHATTING_FRIEND_KEY, key.to_hex()],
            )?;
            tx.commit()?;
            Ok(changed > 0)
        })
        .await
    }

    async fn save_message(&self, peer: &PeerKey, message: &Message) -> Result<InsertResult> {
        let peer = *peer;
        let canonical = message.to_canonical_bytes();
        let hash = MessageHash::of(&canonical);
        let timestamp = i64::try_from(message.timestamp).map_err(|_| {
            StoreError::InvalidData(format!(
                "message timestamp {} does not fit the timestamp column",
                message.timestamp
            ))
        })?;

        self.run(move |conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO messages (hash, peer, timestamp, canonical_bytes, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    hash.as_bytes().as_slice(),
                    peer.as_bytes().as_slice(),
                    timestamp,
                    canonical,
                    now_millis()
                ],
            )?;
            Ok(if changed > 0 {
                InsertResult::Inserted
            } else {
                InsertResult::AlreadyExists
            })
        })
        .await
    }

    async fn get_message(&self, hash: &MessageHash) -> Result<Option<Message>> {
        let hash = *hash;
        self.run(move |conn| {
            let bytes: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT canonical_bytes FROM messages WHERE hash = ?1",
                    params![hash.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            bytes.map(|b| decode_message(&b)).transpose()
        })
        .await
    }

    async fn has_message(&self, hash: &MessageHash) -> Result<bool> {
        let hash = *hash;
        self.run(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM messages WHERE hash = ?1",
                    params![hash.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn latest_messages(&self, peer: &PeerKey, limit: usize) -> Result<Vec<Message>> {
        let peer = *peer;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT canonical_bytes FROM messages
                 WHERE peer = ?1
                 ORDER BY timestamp DESC, hash DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![peer.as_bytes().as_slice(), limit], |row| {
                    row.get::<_, Vec<u8>>(0)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut messages = rows
                .iter()
                .map(|b| decode_message(b))
                .collect::<Result<Vec<_>>>()?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    async fn chatting_friend(&self) -> Result<Option<PeerKey>> {
        let raw = self.get_setting(CHATTING_FRIEND_KEY).await?;
        raw.map(|hex| {
            PeerKey::from_hex(&hex)
                .map_err(|e| StoreError::InvalidData(format!("chatting friend: {}", e)))
        })
        .transpose()
    }

    async fn set_chatting_friend(&self, peer: Option<&PeerKey>) -> Result<()> {
        match peer {
            Some(peer) => self.set_setting(CHATTING_FRIEND_KEY, &peer.to_hex()).await,
            None => {
                self.run(|conn| {
                    conn.execute(
                        "DELETE FROM settings WHERE key = ?1",
                        params![CHATTING_FRIEND_KEY],
                    )?;
                    Ok(())
                })
                .await
            }
        }
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerKey {
        PeerKey::from_bytes([n; 32])
    }

    fn msg(from: u8, to: u8, ts: u64) -> Message {
        Message::new(peer(from), peer(to), ts, format!("payload {}", ts).into_bytes())
    }

    #[tokio::test]
    async fn test_save_and_get_message() {
        let repo = SqliteRepository::open_memory().unwrap();
        let m = msg(1, 2, 1_234_567_890_000);

        assert_eq!(repo.save_message(&peer(2), &m).await.unwrap(), InsertResult::Inserted);
        assert_eq!(
            repo.save_message(&peer(2), &m).await.unwrap(),
            InsertResult::AlreadyExists
        );

        let retrieved = repo.get_message(&m.hash()).await.unwrap().unwrap();
        assert_eq!(retrieved, m);
        assert_eq!(retrieved.hash(), m.hash());
        assert!(repo.has_message(&m.hash()).await.unwrap());
        assert!(!repo.has_message(&MessageHash::from_bytes([0; 32])).await.unwrap());
    }

    #[tokio::test]
    async fn test_timestamp_beyond_column_range_rejected() {
        let repo = SqliteRepository::open_memory().unwrap();
        let edge = msg(1, 2, i64::MAX as u64);
        let beyond = msg(1, 2, i64::MAX as u64 + 1);

        assert_eq!(repo.save_message(&peer(2), &edge).await.unwrap(), InsertResult::Inserted);
        assert!(matches!(
            repo.save_message(&peer(2), &beyond).await,
            Err(StoreError::InvalidData(_))
        ));
        assert!(!repo.has_message(&beyond.hash()).await.unwrap());

        let window = repo.latest_messages(&peer(2), 10).await.unwrap();
        assert_eq!(window, vec![edge]);
    }

    #[tokio::test]
    async fn test_latest_messages_oldest_first() {
        let repo = SqliteRepository::open_memory().unwrap();
        for ts in [5, 1, 4, 2, 3] {
            repo.save_message(&peer(2), &msg(2, 1, ts)).await.unwrap();
        }

        let window = repo.latest_messages(&peer(2), 3).await.unwrap();
        let stamps: Vec<u64> = window.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_friends_keep_insertion_order() {
        let repo = SqliteRepository::open_memory().unwrap();
        for n in [3, 1, 2] {
            assert!(repo.add_friend(&peer(n)).await.unwrap());
        }
        assert!(!repo.add_friend(&peer(1)).await.unwrap());
        assert_eq!(
            repo.list_friends().await.unwrap(),
            vec![peer(3), peer(1), peer(2)]
        );

        repo.set_chatting_friend(Some(&peer(1))).await.unwrap();
        assert!(repo.remove_friend(&peer(1)).await.unwrap());
        assert_eq!(repo.chatting_friend().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_settings_upsert() {
        let repo = SqliteRepository::open_memory().unwrap();
        assert_eq!(repo.get_setting("k").await.unwrap(), None);
        repo.set_setting("k", "1").await.unwrap();
        repo.set_setting("k", "2").await.unwrap();
        assert_eq!(repo.get_setting("k").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");
        let m = msg(1, 2, 42);

        {
            let repo = SqliteRepository::open(&path).unwrap();
            repo.add_friend(&peer(2)).await.unwrap();
            repo.save_message(&peer(2), &m).await.unwrap();
            repo.set_chatting_friend(Some(&peer(2))).await.unwrap();
        }

        let repo = SqliteRepository::open(&path).unwrap();
        assert_eq!(repo.list_friends().await.unwrap(), vec![peer(2)]);
        assert_eq!(repo.latest_messages(&peer(2), 10).await.unwrap(), vec![m]);
        assert_eq!(repo.chatting_friend().await.unwrap(), Some(peer(2)));
    }
}
