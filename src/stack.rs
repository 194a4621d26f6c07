//! Construction of the full store stack.
//!
//! The layers compose statically, bottom-up: base store, encryption,
//! integrity tracking, write-back caching, parallel-access coordination,
//! and finally the blob tree on top. These helpers wire them together in
//! the one correct order so callers cannot accidentally stack them
//! differently.

use std::path::Path;

use crate::blob::BlobStore;
use crate::cache::CachingStore;
use crate::config::StorageConfig;
use crate::crypto::EncryptionKey;
use crate::encrypted::EncryptedStore;
use crate::error::StoreError;
use crate::integrity::{IntegrityStore, KnownBlockTable, STATE_FILE_NAME};
use crate::memstore::InMemoryStore;
use crate::ondisk::OnDiskStore;
use crate::parallel::ParallelAccessStore;

/// The block stack over an on-disk base store.
pub type DiskBlockStack =
    ParallelAccessStore<CachingStore<IntegrityStore<EncryptedStore<OnDiskStore>>>>;

/// The block stack over the in-memory fake, for tests.
pub type MemoryBlockStack =
    ParallelAccessStore<CachingStore<IntegrityStore<EncryptedStore<InMemoryStore>>>>;

/// Open the block stack rooted at `root`.
///
/// The known-block table lives in `<root>/integrity-state`; a present but
/// unreadable table rejects the open.
pub fn open_disk_stack(
    root: &Path,
    key: EncryptionKey,
    config: &StorageConfig,
) -> Result<DiskBlockStack, StoreError> {
    config.validate()?;
    let base = OnDiskStore::new(root)?;
    let table = KnownBlockTable::open(root.join(STATE_FILE_NAME))?;
    let encrypted = EncryptedStore::new(base, key, config.client_id);
    let integrity = IntegrityStore::new(
        encrypted,
        table,
        config.missing_block_is_integrity_violation,
    );
    let caching = CachingStore::new(integrity, config)?;
    Ok(ParallelAccessStore::new(caching))
}

/// Open the blob store rooted at `root`.
pub fn open_disk_blob_store(
    root: &Path,
    key: EncryptionKey,
    config: &StorageConfig,
) -> Result<BlobStore<CachingStore<IntegrityStore<EncryptedStore<OnDiskStore>>>>, StoreError> {
    let capacity = config.plaintext_block_capacity();
    BlobStore::new(open_disk_stack(root, key, config)?, capacity)
}

/// Build the same stack over an in-memory base store. The known-block
/// table is kept in memory only.
pub fn open_memory_stack(
    base: InMemoryStore,
    key: EncryptionKey,
    config: &StorageConfig,
) -> Result<MemoryBlockStack, StoreError> {
    config.validate()?;
    let encrypted = EncryptedStore::new(base, key, config.client_id);
    let integrity = IntegrityStore::new(
        encrypted,
        KnownBlockTable::in_memory(),
        config.missing_block_is_integrity_violation,
    );
    let caching = CachingStore::new(integrity, config)?;
    Ok(ParallelAccessStore::new(caching))
}

/// Blob store over the in-memory stack, for tests.
pub fn open_memory_blob_store(
    base: InMemoryStore,
    key: EncryptionKey,
    config: &StorageConfig,
) -> Result<BlobStore<CachingStore<IntegrityStore<EncryptedStore<InMemoryStore>>>>, StoreError> {
    let capacity = config.plaintext_block_capacity();
    BlobStore::new(open_memory_stack(base, key, config)?, capacity)
}
