//! Canonical CBOR encoding for deterministic serialization.
//!
//! Every wire type is a CBOR map with small integer keys:
//! - Map keys sorted by encoded byte comparison
//! - Integers use smallest valid encoding
//! - Definite lengths only
//! - Absent optional fields are omitted rather than encoded as null
//!
//! Determinism matters twice over: message hashes are computed over these
//! bytes, and batch sizes are measured on them against the DHT item ceiling.

use ciborium::value::{Integer, Value};

use crate::error::{CoreError, Result};

/// A type with a canonical CBOR representation.
pub trait Canonical: Sized {
    /// Human-readable name used in decode errors.
    const NAME: &'static str;

    /// Convert to a CBOR value.
    fn to_value(&self) -> Value;

    /// Parse from a CBOR value.
    fn from_value(value: &Value) -> Result<Self>;

    /// Encode to canonical bytes.
    fn to_canonical_bytes(&self) -> Vec<u8> {
        encode_value(&self.to_value())
    }

    /// Decode from bytes produced by [`Canonical::to_canonical_bytes`].
    fn from_canonical_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_value(&decode_value(bytes)?)
    }

    /// Length of the canonical encoding.
    fn encoded_len(&self) -> usize {
        self.to_canonical_bytes().len()
    }
}

/// Encode a CBOR value to canonical bytes.
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value);
    buf
}

/// Decode a single CBOR value, rejecting trailing bytes.
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    let mut cursor = std::io::Cursor::new(bytes);
    let value: Value =
        ciborium::from_reader(&mut cursor).map_err(|e| CoreError::DecodingError(e.to_string()))?;
    if cursor.position() as usize != bytes.len() {
        return Err(CoreError::DecodingError("trailing bytes after value".into()));
    }
    Ok(value)
}

fn encode_value_to(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => {
            encode_uint(buf, 2, b.len() as u64);
            buf.extend_from_slice(b);
        }
        Value::Text(s) => {
            encode_uint(buf, 3, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Array(arr) => {
            encode_uint(buf, 4, arr.len() as u64);
            for item in arr {
                encode_value_to(buf, item);
            }
        }
        Value::Map(entries) => encode_map_canonical(buf, entries),
        Value::Tag(tag, inner) => {
            encode_uint(buf, 6, *tag);
            encode_value_to(buf, inner);
        }
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Null => buf.push(0xf6),
        Value::Float(f) => {
            buf.push(0xfb);
            buf.extend_from_slice(&f.to_be_bytes());
        }
        // Value is non-exhaustive; nothing in this crate builds other variants.
        _ => buf.push(0xf7),
    }
}

fn encode_integer(buf: &mut Vec<u8>, i: Integer) {
    let n: i128 = i.into();

    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, etc.
        let abs = (-1 - n) as u64;
        encode_uint(buf, 1, abs);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) {
    let mut pairs: Vec<(Vec<u8>, &Value)> = entries
        .iter()
        .map(|(k, v)| (encode_value(k), v))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, pairs.len() as u64);
    for (key_bytes, value) in pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Map construction
// ─────────────────────────────────────────────────────────────────────────────

/// Builds an integer-keyed CBOR map.
#[derive(Default)]
pub(crate) struct MapBuilder {
    entries: Vec<(Value, Value)>,
}

impl MapBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn value(mut self, key: u64, value: Value) -> Self {
        self.entries.push((Value::Integer(key.into()), value));
        self
    }

    pub(crate) fn uint(self, key: u64, n: u64) -> Self {
        self.value(key, Value::Integer(n.into()))
    }

    pub(crate) fn bytes(self, key: u64, bytes: &[u8]) -> Self {
        self.value(key, Value::Bytes(bytes.to_vec()))
    }

    pub(crate) fn array(self, key: u64, items: Vec<Value>) -> Self {
        self.value(key, Value::Array(items))
    }

    pub(crate) fn opt_value(self, key: u64, value: Option<Value>) -> Self {
        match value {
            Some(v) => self.value(key, v),
            None => self,
        }
    }

    pub(crate) fn build(self) -> Value {
        Value::Map(self.entries)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Map access
// ─────────────────────────────────────────────────────────────────────────────

/// Typed field access over an integer-keyed CBOR map.
pub(crate) struct MapReader<'a> {
    what: &'static str,
    entries: &'a [(Value, Value)],
}

impl<'a> MapReader<'a> {
    pub(crate) fn new(what: &'static str, value: &'a Value) -> Result<Self> {
        match value {
            Value::Map(entries) => Ok(Self { what, entries }),
            _ => Err(CoreError::malformed(what, "expected map")),
        }
    }

    fn get(&self, key: u64) -> Option<&'a Value> {
        self.entries
            .iter()
            .find(|(k, _)| matches!(k, Value::Integer(i) if u64::try_from(*i).ok() == Some(key)))
            .map(|(_, v)| v)
    }

    fn missing(&self, key: u64) -> CoreError {
        CoreError::malformed(self.what, format!("missing field {}", key))
    }

    fn invalid(&self, key: u64) -> CoreError {
        CoreError::malformed(self.what, format!("invalid field {}", key))
    }

    pub(crate) fn value(&self, key: u64) -> Result<&'a Value> {
        self.get(key).ok_or_else(|| self.missing(key))
    }

    pub(crate) fn opt_value(&self, key: u64) -> Option<&'a Value> {
        self.get(key).filter(|v| !v.is_null())
    }

    pub(crate) fn uint(&self, key: u64) -> Result<u64> {
        value_as_uint(self.value(key)?).ok_or_else(|| self.invalid(key))
    }

    pub(crate) fn bytes(&self, key: u64) -> Result<&'a [u8]> {
        match self.value(key)? {
            Value::Bytes(b) => Ok(b),
            _ => Err(self.invalid(key)),
        }
    }

    pub(crate) fn fixed<const N: usize>(&self, key: u64) -> Result<[u8; N]> {
        self.bytes(key)?
            .try_into()
            .map_err(|_| self.invalid(key))
    }

    pub(crate) fn opt_fixed<const N: usize>(&self, key: u64) -> Result<Option<[u8; N]>> {
        match self.opt_value(key) {
            None => Ok(None),
            Some(Value::Bytes(b)) => b
                .as_slice()
                .try_into()
                .map(Some)
                .map_err(|_| self.invalid(key)),
            Some(_) => Err(self.invalid(key)),
        }
    }

    /// An array field; a missing field reads as empty.
    pub(crate) fn array(&self, key: u64) -> Result<&'a [Value]> {
        match self.get(key) {
            None => Ok(&[]),
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(self.invalid(key)),
        }
    }
}

/// Read an unsigned integer value.
pub(crate) fn value_as_uint(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(i) => u64::try_from(*i).ok(),
        _ => None,
    }
}

/// Read a fixed-length byte string value.
pub(crate) fn value_as_fixed<const N: usize>(value: &Value) -> Option<[u8; N]> {
    match value {
        Value::Bytes(b) => b.as_slice().try_into().ok(),
        _ => None,
    }
}
