//! Streaming content fingerprints used for change detection.
//!
//! A fingerprint answers "did this change since last time?" and nothing else.
//! Collisions are tolerated; callers never use a fingerprint as an identity.

use std::fmt;

use serde::{Deserialize, Serialize};

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Bytes written after every field. `0xff` never occurs inside UTF-8, so
/// `("ab", "c")` and `("a", "bc")` hash differently.
const FIELD_SEPARATOR: [u8; 1] = [0xff];

/// Opaque 64-bit content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// FNV-1a (64-bit) writer with a separator after every field.
#[derive(Debug, Clone)]
pub struct FingerprintWriter {
    state: u64,
}

impl Default for FingerprintWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintWriter {
    pub fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }

    fn write_raw(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.state ^= u64::from(*b);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }

    /// Write one field followed by the separator.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_raw(bytes);
        self.write_raw(&FIELD_SEPARATOR);
        self
    }

    pub fn write_str(&mut self, s: &str) -> &mut Self {
        self.write_bytes(s.as_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.write_bytes(&[u8::from(v)])
    }

    /// Write an optional field; `None` and `Some("")` stay distinguishable.
    pub fn write_opt_str(&mut self, v: Option<&str>) -> &mut Self {
        match v {
            Some(s) => {
                self.write_bool(true);
                self.write_str(s)
            }
            None => self.write_bool(false),
        }
    }

    /// Write an unordered collection of pre-hashed items. The items are sorted
    /// first so the result does not depend on their order.
    pub fn write_unordered(&mut self, mut items: Vec<u64>) -> &mut Self {
        items.sort_unstable();
        self.write_u64(items.len() as u64);
        for item in items {
            self.write_u64(item);
        }
        self
    }

    pub fn finish(&self) -> Fingerprint {
        Fingerprint(self.state)
    }
}
