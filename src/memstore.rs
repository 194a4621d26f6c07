//! In-memory block store for testing.
//!
//! Stores block bytes verbatim with no format header, so
//! `block_size_from_physical` is the identity. Clones share the same
//! underlying storage. Operation counters let tests assert how often the
//! layers above actually hit the base store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block_id::BlockId;
use crate::error::StoreError;
use crate::store::BlockStore;

#[derive(Default)]
struct OpCounters {
    loads: AtomicU64,
    stores: AtomicU64,
    removes: AtomicU64,
}

/// In-memory fake of the base store.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    blocks: Arc<Mutex<HashMap<BlockId, Vec<u8>>>>,
    counters: Arc<OpCounters>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `load` calls that reached this store.
    #[must_use]
    pub fn load_count(&self) -> u64 {
        self.counters.loads.load(Ordering::SeqCst)
    }

    /// Number of `store`/`try_create` writes that reached this store.
    #[must_use]
    pub fn store_count(&self) -> u64 {
        self.counters.stores.load(Ordering::SeqCst)
    }

    /// Number of `remove` calls that reached this store.
    #[must_use]
    pub fn remove_count(&self) -> u64 {
        self.counters.removes.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.counters.loads.store(0, Ordering::SeqCst);
        self.counters.stores.store(0, Ordering::SeqCst);
        self.counters.removes.store(0, Ordering::SeqCst);
    }

    /// Raw stored bytes of a block, for tamper tests.
    #[must_use]
    pub fn raw_bytes(&self, id: &BlockId) -> Option<Vec<u8>> {
        self.blocks.lock().get(id).cloned()
    }

    /// Replace the raw stored bytes of a block, for tamper tests.
    /// Returns whether a block with this id existed.
    pub fn replace_raw_bytes(&self, id: &BlockId, data: Vec<u8>) -> bool {
        self.blocks.lock().insert(*id, data).is_some()
    }
}

impl BlockStore for InMemoryStore {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool, StoreError> {
        let mut blocks = self.blocks.lock();
        if blocks.contains_key(id) {
            return Ok(false);
        }
        self.counters.stores.fetch_add(1, Ordering::SeqCst);
        blocks.insert(*id, data.to_vec());
        Ok(true)
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<(), StoreError> {
        self.counters.stores.fetch_add(1, Ordering::SeqCst);
        self.blocks.lock().insert(*id, data.to_vec());
        Ok(())
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>, StoreError> {
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.blocks.lock().get(id).cloned())
    }

    fn remove(&self, id: &BlockId) -> Result<bool, StoreError> {
        self.counters.removes.fetch_add(1, Ordering::SeqCst);
        Ok(self.blocks.lock().remove(id).is_some())
    }

    fn num_blocks(&self) -> Result<u64, StoreError> {
        Ok(self.blocks.lock().len() as u64)
    }

    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId)) -> Result<(), StoreError> {
        for id in self.blocks.lock().keys() {
            callback(id);
        }
        Ok(())
    }

    fn estimate_free_bytes(&self) -> Result<u64, StoreError> {
        Ok(u64::MAX)
    }

    fn block_size_from_physical(&self, physical: u64) -> u64 {
        physical
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
