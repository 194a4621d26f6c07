//! Block identifiers.
//!
//! A `BlockId` is an opaque 128-bit identifier drawn from a cryptographic
//! RNG at block creation. Ids are never recycled within the lifetime of a
//! filesystem; the canonical textual form is 32 lowercase hex characters,
//! which is also how blocks are addressed on disk.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;

/// Size of a block id in bytes.
pub const BLOCK_ID_SIZE: usize = 16;

/// Length of the canonical hex string form.
pub const BLOCK_ID_HEX_LEN: usize = 2 * BLOCK_ID_SIZE;

/// Opaque 128-bit identifier of a stored block.
///
/// Ordered and hashable; the ordering is the lexicographic byte order,
/// which matches the ordering of the hex form.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId([u8; BLOCK_ID_SIZE]);

impl BlockId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; BLOCK_ID_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; BLOCK_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice; `None` unless it is exactly 16 bytes.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; BLOCK_ID_SIZE] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; BLOCK_ID_SIZE] {
        &self.0
    }

    /// Canonical 32-character lowercase hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the canonical hex form; accepts upper- and lowercase.
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != BLOCK_ID_HEX_LEN {
            return None;
        }
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let id = BlockId::random();
        let hex = id.to_hex();
        assert_eq!(hex.len(), BLOCK_ID_HEX_LEN);
        assert_eq!(BlockId::from_hex(&hex), Some(id));
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(BlockId::from_hex("").is_none());
        assert!(BlockId::from_hex("abcd").is_none());
        assert!(BlockId::from_hex(&"g".repeat(BLOCK_ID_HEX_LEN)).is_none());
        assert!(BlockId::from_hex(&"0".repeat(BLOCK_ID_HEX_LEN + 2)).is_none());
    }

    #[test]
    fn from_hex_accepts_uppercase() {
        let id = BlockId::from_bytes([0xAB; 16]);
        let upper = id.to_hex().to_uppercase();
        assert_eq!(BlockId::from_hex(&upper), Some(id));
    }

    #[test]
    fn random_ids_are_distinct() {
        let a = BlockId::random();
        let b = BlockId::random();
        assert_ne!(a, b);
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = BlockId::from_bytes([0u8; 16]);
        let mut high = [0u8; 16];
        high[0] = 1;
        let b = BlockId::from_bytes(high);
        assert!(a < b);
        assert!(a.to_hex() < b.to_hex());
    }
}
