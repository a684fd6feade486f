//! A small Bloom filter for friend-list digests.
//!
//! Two devices sharing an identity compare friend lists by exchanging this
//! digest on the self channel. A key missing from the other device's filter
//! is definitely unknown there; a present key may be a false positive.

use ciborium::value::Value;

use crate::canonical::{Canonical, MapBuilder, MapReader};
use crate::error::{CoreError, Result};

mod keys {
    pub const HASHES: u64 = 0;
    pub const BITS: u64 = 1;
}

/// Most hash functions a filter may use; each consumes 4 bytes of one Blake3 digest.
pub const MAX_HASHES: u8 = 8;

/// Fixed-size Bloom filter over byte strings.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    hashes: u8,
}

impl BloomFilter {
    /// Create an empty filter of `num_bytes` bytes using `hashes` hash functions.
    ///
    /// Both parameters are clamped to at least 1; `hashes` is capped at [`MAX_HASHES`].
    pub fn new(num_bytes: usize, hashes: u8) -> Self {
        Self {
            bits: vec![0u8; num_bytes.max(1)],
            hashes: hashes.clamp(1, MAX_HASHES),
        }
    }

    /// Build a filter containing every item.
    pub fn from_items<'a>(
        num_bytes: usize,
        hashes: u8,
        items: impl IntoIterator<Item = &'a [u8]>,
    ) -> Self {
        let mut filter = Self::new(num_bytes, hashes);
        for item in items {
            filter.insert(item);
        }
        filter
    }

    /// Insert an item.
    pub fn insert(&mut self, item: &[u8]) {
        for idx in bit_indexes(item, self.hashes, self.bit_len()) {
            self.bits[idx / 8] |= 1 << (idx % 8);
        }
    }

    /// Returns `false` if the item is definitely absent.
    pub fn may_contain(&self, item: &[u8]) -> bool {
        bit_indexes(item, self.hashes, self.bit_len())
            .all(|idx| self.bits[idx / 8] & (1 << (idx % 8)) != 0)
    }

    /// Number of bits in the filter.
    pub fn bit_len(&self) -> usize {
        self.bits.len() * 8
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }
}

/// Bit positions for `item`. Borrows nothing from the filter so `insert` can write.
fn bit_indexes(item: &[u8], hashes: u8, bit_len: usize) -> impl Iterator<Item = usize> {
    let digest = *blake3::hash(item).as_bytes();
    (0..hashes as usize).map(move |i| {
        let chunk = [
            digest[i * 4],
            digest[i * 4 + 1],
            digest[i * 4 + 2],
            digest[i * 4 + 3],
        ];
        u32::from_le_bytes(chunk) as usize % bit_len
    })
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set: u32 = self.bits.iter().map(|b| b.count_ones()).sum();
        write!(
            f,
            "BloomFilter({} bits, {} set, k={})",
            self.bit_len(),
            set,
            self.hashes
        )
    }
}

impl Canonical for BloomFilter {
    const NAME: &'static str = "bloom filter";

    fn to_value(&self) -> Value {
        MapBuilder::new()
            .uint(keys::HASHES, self.hashes.into())
            .bytes(keys::BITS, &self.bits)
            .build()
    }

    fn from_value(value: &Value) -> Result<Self> {
        let map = MapReader::new(Self::NAME, value)?;
        let hashes = u8::try_from(map.uint(keys::HASHES)?)
            .ok()
            .filter(|k| (1..=MAX_HASHES).contains(k))
            .ok_or_else(|| CoreError::malformed(Self::NAME, "hash count out of range"))?;
        let bits = map.bytes(keys::BITS)?;
        if bits.is_empty() {
            return Err(CoreError::malformed(Self::NAME, "empty bit array"));
        }
        Ok(Self {
            bits: bits.to_vec(),
            hashes,
        })
    }
}
