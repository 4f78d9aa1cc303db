//! Opaque 12-byte document identifier (SPEC_FULL.md §6).
//!
//! Layout, big-endian throughout:
//! - bytes `0..4`: seconds since the Unix epoch at creation
//! - bytes `4..9`: 5 bytes of per-process random state, fixed at process start
//! - bytes `9..12`: 3-byte counter, incremented under one atomic for every id
//!   generated by this process, seeded from a random 24-bit value
//!
//! This mirrors the re-architected pattern in SPEC_FULL.md §9: "thread-local
//! counters for opaque-id generation" becomes one process-global counter.
//! An atomic fetch-add is used instead of a `Mutex<u32>` — the critical
//! section is a single add, so the mutex would only add contention without
//! changing the invariant (two ids minted in the same process in the same
//! second still differ by the counter).

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{DocqTypesError, Result};

fn process_random() -> &'static [u8; 5] {
    static RANDOM: OnceLock<[u8; 5]> = OnceLock::new();
    RANDOM.get_or_init(|| {
        let mut bytes = [0u8; 5];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    })
}

fn counter() -> &'static AtomicU32 {
    static COUNTER: OnceLock<AtomicU32> = OnceLock::new();
    COUNTER.get_or_init(|| {
        let seed = rand::thread_rng().next_u32() & 0x00FF_FFFF;
        AtomicU32::new(seed)
    })
}

/// A 12-byte opaque document identifier, hex-encoded to 24 lowercase chars
/// for textual interchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Generates a fresh id from the current time, the per-process random
    /// state, and the next value of the process-global counter.
    pub fn generate() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&(secs as u32).to_be_bytes());
        bytes[4..9].copy_from_slice(process_random());

        let n = counter().fetch_add(1, Ordering::Relaxed).wrapping_add(1) & 0x00FF_FFFF;
        let counter_bytes = n.to_be_bytes();
        bytes[9..12].copy_from_slice(&counter_bytes[1..4]);

        Self(bytes)
    }

    /// Builds an id from raw bytes (round-trip helper, SPEC_FULL.md §8 invariant 3).
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }

    /// Decodes a 24-character lowercase hex string into an id.
    pub fn parse_hex(s: &str) -> Result<Self> {
        if s.len() != 24 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DocqTypesError::InvalidObjectId(s.to_string()));
        }
        let mut bytes = [0u8; 12];
        for (i, chunk) in bytes.iter_mut().enumerate() {
            let hi = hex_val(s.as_bytes()[i * 2]).ok_or_else(|| DocqTypesError::InvalidObjectId(s.to_string()))?;
            let lo = hex_val(s.as_bytes()[i * 2 + 1]).ok_or_else(|| DocqTypesError::InvalidObjectId(s.to_string()))?;
            *chunk = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }

    /// Returns the 24-character lowercase hex encoding.
    pub fn to_hex(self) -> String {
        let mut out = String::with_capacity(24);
        for b in self.0 {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    /// Decodes the creation timestamp embedded in bytes `0..4`.
    pub fn generation_time(&self) -> u32 {
        u32::from_be_bytes(self.0[0..4].try_into().expect("4 bytes"))
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.to_hex()
    }
}

impl TryFrom<String> for ObjectId {
    type Error = DocqTypesError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse_hex(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = ObjectId::generate();
        let hex = id.to_hex();
        let back = ObjectId::parse_hex(&hex).unwrap();
        assert_eq!(id, back);
        assert_eq!(ObjectId::from_bytes(back.bytes()), id);
    }

    #[test]
    fn same_second_ids_differ() {
        let a = ObjectId::generate();
        let b = ObjectId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(ObjectId::parse_hex("too-short").is_err());
        assert!(ObjectId::parse_hex(&"zz".repeat(12)).is_err());
    }

    #[test]
    fn generation_time_matches_creation_second() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32;
        let id = ObjectId::generate();
        let after = before + 2;
        let t = id.generation_time();
        assert!(t >= before && t <= after);
    }
}
