//! Identities and mutable-item signatures.
//!
//! A peer is its Ed25519 public key. Everything a peer publishes under a
//! salt is signed over the salt, the sequence number and the value, so a
//! record copied to another salt or replayed with a different sequence
//! fails verification.

use std::fmt;

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{ShortAddress, SHORT_ADDRESS_LENGTH};

/// Bytes covered by a mutable-item signature.
fn item_signable(salt: &[u8], seq: u64, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + salt.len() + 8 + value.len());
    buf.extend_from_slice(&(salt.len() as u32).to_be_bytes());
    buf.extend_from_slice(salt);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

/// A 32-byte Ed25519 public key identifying a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerKey(pub [u8; 32]);

impl PeerKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The lossy short address used inside gossip items and salts.
    pub fn short_address(&self) -> ShortAddress {
        let mut arr = [0u8; SHORT_ADDRESS_LENGTH];
        arr.copy_from_slice(&self.0[..SHORT_ADDRESS_LENGTH]);
        ShortAddress(arr)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    /// Check that this key signed `value` under `salt` at sequence `seq`.
    pub fn verify_item(
        &self,
        salt: &[u8],
        seq: u64,
        value: &[u8],
        signature: &Signature,
    ) -> Result<(), CoreError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;
        verifying_key
            .verify(
                &item_signable(salt, seq, value),
                &DalekSignature::from_bytes(&signature.0),
            )
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl TryFrom<&[u8]> for PeerKey {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(slice.try_into()?))
    }
}

/// Signature over a salted mutable item.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..8]))
    }
}

/// The signing half of an identity.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Deterministic keypair; every device of one identity derives the same key.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> PeerKey {
        PeerKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign `value` for publication under `salt` at sequence `seq`.
    pub fn sign_item(&self, salt: &[u8], seq: u64, value: &[u8]) -> Signature {
        Signature(
            self.signing_key
                .sign(&item_signable(salt, seq, value))
                .to_bytes(),
        )
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({:?})", self.public_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_signature_binds_salt_and_seq() {
        let keypair = Keypair::generate();
        let key = keypair.public_key();
        let signature = keypair.sign_item(b"salt-a", 3, b"value");

        assert!(key.verify_item(b"salt-a", 3, b"value", &signature).is_ok());
        assert!(key.verify_item(b"salt-b", 3, b"value", &signature).is_err());
        assert!(key.verify_item(b"salt-a", 4, b"value", &signature).is_err());
        assert!(key.verify_item(b"salt-a", 3, b"other", &signature).is_err());
    }

    #[test]
    fn test_salt_boundary_is_unambiguous() {
        // "ab" + "c" and "a" + "bc" must not share a signature.
        let keypair = Keypair::from_seed(&[7; 32]);
        let signature = keypair.sign_item(b"ab", 0, b"c");
        assert!(keypair
            .public_key()
            .verify_item(b"a", 0, b"bc", &signature)
            .is_err());
    }

    #[test]
    fn test_signature_from_other_key_rejected() {
        let alice = Keypair::from_seed(&[1; 32]);
        let bob = Keypair::from_seed(&[2; 32]);
        let signature = alice.sign_item(b"s", 1, b"hello");
        assert!(matches!(
            bob.public_key().verify_item(b"s", 1, b"hello", &signature),
            Err(CoreError::InvalidSignature)
        ));
    }

    #[test]
    fn test_devices_share_identity_from_seed() {
        let laptop = Keypair::from_seed(&[0x42; 32]);
        let phone = Keypair::from_seed(&[0x42; 32]);
        assert_eq!(laptop.public_key(), phone.public_key());
    }

    #[test]
    fn test_hex_rejects_wrong_length() {
        let pk = Keypair::generate().public_key();
        assert_eq!(PeerKey::from_hex(&pk.to_hex()).unwrap(), pk);
        assert!(PeerKey::from_hex("abcd").is_err());
    }
}
