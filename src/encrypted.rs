//! Transparent authenticated encryption of block bodies.
//!
//! `EncryptedStore` wraps a base store and seals every body on the way
//! down, unseals on the way up. It exposes the `VersionedBlockStore`
//! contract instead of the plain one because the integrity layer above
//! needs the freshness header of every loaded or stored ciphertext; the
//! plain contract would throw that information away.
//!
//! The layer is stateless across calls except for the monotonic version
//! counter; it never retries on its own.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::block_id::BlockId;
use crate::crypto::{seal, unseal, BlockHeader, EncryptionKey, UnsealedBlock, SEALED_OVERHEAD};
use crate::error::StoreError;
use crate::store::BlockStore;

/// The block store contract enriched with the freshness header.
///
/// `load` hands the `(version, client_id)` header up alongside the body;
/// `store` and `try_create` report the header they wrote so the caller
/// can record it.
pub trait VersionedBlockStore: Send + Sync {
    /// Create the block only if the id is free. `Ok(None)` means the id
    /// was taken; `Ok(Some(header))` reports the header that was written.
    fn try_create(&self, id: &BlockId, body: &[u8]) -> Result<Option<BlockHeader>, StoreError>;

    /// Overwrite the block and report the header that was written.
    fn store(&self, id: &BlockId, body: &[u8]) -> Result<BlockHeader, StoreError>;

    /// Load and unseal the block, or `None` if it does not exist.
    fn load(&self, id: &BlockId) -> Result<Option<UnsealedBlock>, StoreError>;

    fn remove(&self, id: &BlockId) -> Result<bool, StoreError>;

    fn num_blocks(&self) -> Result<u64, StoreError>;

    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId)) -> Result<(), StoreError>;

    fn estimate_free_bytes(&self) -> Result<u64, StoreError>;

    fn block_size_from_physical(&self, physical: u64) -> u64;

    fn flush(&self) -> Result<(), StoreError>;

    /// Raise the version counter so every future write uses a version of
    /// at least `floor`. Versions never repeat across restarts because the
    /// integrity layer calls this with one past the highest version it has
    /// on record.
    fn bump_version_floor(&self, floor: u64);
}

/// Block store transformer applying AES-256-GCM to every block body.
pub struct EncryptedStore<B: BlockStore> {
    base: B,
    key: EncryptionKey,
    client_id: u32,
    version_counter: AtomicU64,
}

impl<B: BlockStore> EncryptedStore<B> {
    pub fn new(base: B, key: EncryptionKey, client_id: u32) -> Self {
        Self {
            base,
            key,
            client_id,
            version_counter: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    fn next_header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version_counter.fetch_add(1, Ordering::SeqCst),
            client_id: self.client_id,
        }
    }
}

impl<B: BlockStore> VersionedBlockStore for EncryptedStore<B> {
    fn try_create(&self, id: &BlockId, body: &[u8]) -> Result<Option<BlockHeader>, StoreError> {
        let header = self.next_header();
        let sealed = seal(&self.key, id, header, body)?;
        if self.base.try_create(id, &sealed)? {
            Ok(Some(header))
        } else {
            Ok(None)
        }
    }

    fn store(&self, id: &BlockId, body: &[u8]) -> Result<BlockHeader, StoreError> {
        let header = self.next_header();
        let sealed = seal(&self.key, id, header, body)?;
        self.base.store(id, &sealed)?;
        Ok(header)
    }

    fn load(&self, id: &BlockId) -> Result<Option<UnsealedBlock>, StoreError> {
        let Some(sealed) = self.base.load(id)? else {
            return Ok(None);
        };
        unseal(&self.key, id, &sealed).map(Some)
    }

    fn remove(&self, id: &BlockId) -> Result<bool, StoreError> {
        self.base.remove(id)
    }

    fn num_blocks(&self) -> Result<u64, StoreError> {
        self.base.num_blocks()
    }

    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId)) -> Result<(), StoreError> {
        self.base.for_each_block(callback)
    }

    fn estimate_free_bytes(&self) -> Result<u64, StoreError> {
        self.base.estimate_free_bytes()
    }

    fn block_size_from_physical(&self, physical: u64) -> u64 {
        self.base
            .block_size_from_physical(physical)
            .saturating_sub(SEALED_OVERHEAD as u64)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.base.flush()
    }

    fn bump_version_floor(&self, floor: u64) {
        self.version_counter.fetch_max(floor, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_SIZE;
    use crate::error::IntegrityViolationKind;
    use crate::memstore::InMemoryStore;

    fn store() -> (InMemoryStore, EncryptedStore<InMemoryStore>) {
        let base = InMemoryStore::new();
        let key = EncryptionKey::from_array([0x11; KEY_SIZE]);
        (base.clone(), EncryptedStore::new(base, key, 42))
    }

    #[test]
    fn roundtrip_preserves_body_and_header() {
        let (_base, store) = store();
        let id = BlockId::random();
        let header = store.store(&id, b"body").unwrap();
        assert_eq!(header.client_id, 42);

        let loaded = store.load(&id).unwrap().unwrap();
        assert_eq!(loaded.body, b"body");
        assert_eq!(loaded.header, header);
    }

    #[test]
    fn versions_increase_monotonically() {
        let (_base, store) = store();
        let id = BlockId::random();
        let first = store.store(&id, b"a").unwrap();
        let second = store.store(&id, b"b").unwrap();
        assert!(second.version > first.version);
    }

    #[test]
    fn version_floor_is_respected() {
        let (_base, store) = store();
        store.bump_version_floor(1000);
        let id = BlockId::random();
        let header = store.store(&id, b"a").unwrap();
        assert!(header.version >= 1000);
        // Bumping below the current counter does nothing.
        store.bump_version_floor(5);
        let header = store.store(&id, b"b").unwrap();
        assert!(header.version > 1000);
    }

    #[test]
    fn stored_bytes_are_not_plaintext() {
        let (base, store) = store();
        let id = BlockId::random();
        store.store(&id, b"very secret body").unwrap();
        let raw = base.raw_bytes(&id).unwrap();
        assert!(!raw
            .windows(b"very secret body".len())
            .any(|w| w == b"very secret body"));
    }

    #[test]
    fn load_missing_returns_none() {
        let (_base, store) = store();
        assert!(store.load(&BlockId::random()).unwrap().is_none());
    }

    #[test]
    fn try_create_reports_taken_id() {
        let (_base, store) = store();
        let id = BlockId::random();
        assert!(store.try_create(&id, b"a").unwrap().is_some());
        assert!(store.try_create(&id, b"b").unwrap().is_none());
    }

    #[test]
    fn tampered_bytes_fail_authentication() {
        let (base, store) = store();
        let id = BlockId::random();
        store.store(&id, b"body").unwrap();
        let mut raw = base.raw_bytes(&id).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        base.replace_raw_bytes(&id, raw);
        match store.load(&id) {
            Err(StoreError::IntegrityViolation { kind, .. }) => {
                assert_eq!(kind, IntegrityViolationKind::AeadMismatch);
            }
            other => panic!("expected AeadMismatch, got {other:?}"),
        }
    }

    #[test]
    fn swapped_ciphertexts_are_detected() {
        let (base, store) = store();
        let id_a = BlockId::random();
        let id_b = BlockId::random();
        store.store(&id_a, b"a").unwrap();
        store.store(&id_b, b"b").unwrap();
        let raw_b = base.raw_bytes(&id_b).unwrap();
        base.replace_raw_bytes(&id_a, raw_b);
        match store.load(&id_a) {
            Err(StoreError::IntegrityViolation { kind, .. }) => {
                assert_eq!(kind, IntegrityViolationKind::Swap);
            }
            other => panic!("expected Swap, got {other:?}"),
        }
    }

    #[test]
    fn block_size_from_physical_strips_sealing_overhead() {
        let (_base, store) = store();
        assert_eq!(
            store.block_size_from_physical(1024),
            1024 - SEALED_OVERHEAD as u64
        );
    }
}
