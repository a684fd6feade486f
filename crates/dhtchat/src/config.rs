//! Node configuration, loadable from JSON.
//!
//! ```json
//! {
//!   "database": "chat.db",
//!   "device_id": "00112233445566778899aabbccddeeff",
//!   "engine": { "min_loop_interval": 100, "weights": { "chatting": 0.8 } }
//! }
//! ```
//!
//! Every field is optional. Engine durations are integer milliseconds.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use dhtchat_core::DeviceId;
use dhtchat_sync::EngineConfig;

use crate::error::{NodeError, Result};

/// Configuration for a [`ChatNode`](crate::ChatNode).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// SQLite database file. Required by [`ChatNode::open`](crate::ChatNode::open).
    pub database: Option<PathBuf>,
    /// Hex-encoded 16-byte device id. A random id is used when absent.
    pub device_id: Option<String>,
    pub engine: EngineConfig,
}

impl NodeConfig {
    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The configured device id, or a fresh random one.
    pub fn device_id(&self) -> Result<DeviceId> {
        let Some(raw) = &self.device_id else {
            return Ok(DeviceId::random());
        };
        let bytes = hex::decode(raw.trim())
            .map_err(|e| NodeError::InvalidConfig(format!("device_id: {}", e)))?;
        let bytes: [u8; 16] = bytes.try_into().map_err(|b: Vec<u8>| {
            NodeError::InvalidConfig(format!("device_id: expected 16 bytes, got {}", b.len()))
        })?;
        Ok(DeviceId::from_bytes(bytes))
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.time_slice.is_zero() {
            return Err(NodeError::InvalidConfig("engine.time_slice must be non-zero".into()));
        }
        if engine.min_loop_interval > engine.max_loop_interval {
            return Err(NodeError::InvalidConfig(
                "engine.min_loop_interval exceeds engine.max_loop_interval".into(),
            ));
        }
        if !(0.0..=1.0).contains(&engine.queue_threshold) {
            return Err(NodeError::InvalidConfig(
                "engine.queue_threshold must be within [0, 1]".into(),
            ));
        }
        if engine.window_size == 0 || engine.max_wrappers_per_put == 0 {
            return Err(NodeError::InvalidConfig(
                "engine.window_size and engine.max_wrappers_per_put must be positive".into(),
            ));
        }
        self.device_id().map(|_| ())
    }
}
