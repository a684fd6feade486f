//! Strong type definitions for dhtchat.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::PeerKey;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Number of leading public-key bytes carried in gossip items.
pub const SHORT_ADDRESS_LENGTH: usize = 4;

/// The first [`SHORT_ADDRESS_LENGTH`] bytes of a peer's public key.
///
/// Short addresses keep gossip items small. They are lossy: two keys may
/// share a short address, so they are only ever resolved against a known
/// friend set and never used as map keys for per-peer state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShortAddress(pub [u8; SHORT_ADDRESS_LENGTH]);

impl ShortAddress {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; SHORT_ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; SHORT_ADDRESS_LENGTH] {
        &self.0
    }

    /// Whether this short address is a prefix of `key`.
    pub fn matches(&self, key: &PeerKey) -> bool {
        key.as_bytes()[..SHORT_ADDRESS_LENGTH] == self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ShortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortAddress({})", self.to_hex())
    }
}

impl fmt::Display for ShortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<&PeerKey> for ShortAddress {
    fn from(key: &PeerKey) -> Self {
        key.short_address()
    }
}

impl TryFrom<&[u8]> for ShortAddress {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; SHORT_ADDRESS_LENGTH] = slice.try_into()?;
        Ok(Self(arr))
    }
}

/// A 32-byte message content hash, computed as Blake3(canonical message bytes).
///
/// The first byte doubles as the message's entry in a hash-prefix array.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageHash(pub [u8; 32]);

impl MessageHash {
    /// Compute the hash of the given bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The one-byte prefix used in digests.
    pub const fn prefix(&self) -> u8 {
        self.0[0]
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for MessageHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for MessageHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for MessageHash {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; 32] = slice.try_into()?;
        Ok(Self(arr))
    }
}

/// Identifies one installation sharing an identity key pair.
///
/// Signals carry the publishing device so that a second device using the
/// same key can be detected on the self channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub [u8; 16]);

impl DeviceId {
    /// Generate a random device ID.
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.to_hex())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_address_matches_key_prefix() {
        let key = PeerKey::from_bytes([0x11; 32]);
        let short = key.short_address();
        assert_eq!(short.as_bytes(), &[0x11; 4]);
        assert!(short.matches(&key));

        let other = PeerKey::from_bytes([0x12; 32]);
        assert!(!short.matches(&other));
    }

    #[test]
    fn test_message_hash_prefix_is_first_byte() {
        let hash = MessageHash::of(b"hello");
        assert_eq!(hash.prefix(), hash.as_bytes()[0]);
    }

    #[test]
    fn test_message_hash_hex_roundtrip() {
        let hash = MessageHash::from_bytes([0x42; 32]);
        let recovered = MessageHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, recovered);
        assert!(MessageHash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_message_hash_display() {
        let hash = MessageHash::from_bytes([0xab; 32]);
        assert_eq!(format!("{}", hash), "abababababababab");
        assert!(format!("{:?}", hash).starts_with("MessageHash("));
    }
}
