//! Per-block mutual exclusion with shared in-memory instances.
//!
//! This is the top of the block-store stack and its sole serialization
//! point: for any block id there is at most one plaintext body in memory,
//! shared across threads through reference-counted [`BlockHandle`]s. A
//! handle's rw-lock totally orders writes to its block and admits
//! concurrent reads; distinct ids are fully independent.
//!
//! Loads of an id that is already in flight do not hit the layer below a
//! second time: the first arrival inserts a placeholder and loads outside
//! the table lock, later arrivals wait on the placeholder's condition
//! until the body is published.
//!
//! Dropping the last handle for an id writes a dirty body back to the
//! layer below and releases the id from the table. Errors on that path
//! cannot propagate and are logged; use [`ParallelAccessStore::flush`]
//! (or [`BlockHandle::flush`]) where errors must surface.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use zeroize::Zeroize;

use crate::block_id::BlockId;
use crate::error::StoreError;
use crate::store::BlockStore;

/// An in-memory plaintext block.
///
/// Only reachable through the guards of a [`BlockHandle`], so all access
/// is under the per-entry rw-lock.
pub struct Block {
    id: BlockId,
    body: Vec<u8>,
    dirty: bool,
}

impl Block {
    fn new(id: BlockId, body: Vec<u8>) -> Self {
        Self {
            id,
            body,
            dirty: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.body.len()
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.body
    }

    /// Read `len` bytes at `offset`; `None` when out of bounds.
    #[must_use]
    pub fn read_at(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        self.body.get(offset..end)
    }

    /// Write within the current size; `false` when out of bounds.
    #[must_use]
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> bool {
        let Some(end) = offset.checked_add(data.len()) else {
            return false;
        };
        if end > self.body.len() {
            return false;
        }
        self.body[offset..end].copy_from_slice(data);
        self.dirty = true;
        true
    }

    /// Grow (zero-filling) or shrink the block in place.
    pub fn resize(&mut self, new_size: usize) {
        self.body.resize(new_size, 0);
        self.dirty = true;
    }

    /// Replace the whole body.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body.zeroize();
        self.body = body;
        self.dirty = true;
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.body.zeroize();
    }
}

enum SlotState {
    /// The first arrival is loading from the layer below.
    Loading,
    /// The body is published; all handles share this block.
    Ready(Arc<RwLock<Block>>),
    /// The load found no block; the entry has been torn down.
    Missing,
    /// The load failed; the entry has been torn down.
    Failed,
}

struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

struct TableEntry {
    slot: Arc<Slot>,
    refs: usize,
}

enum Claim {
    /// An entry for the id already exists; wait for it if still loading.
    Join(Arc<Slot>),
    /// We inserted the placeholder and own the load.
    Lead(Arc<Slot>),
}

struct ParallelShared<B: BlockStore> {
    base: B,
    table: Mutex<HashMap<BlockId, TableEntry>>,
    /// Signalled whenever a table entry is released or torn down.
    released: Condvar,
}

impl<B: BlockStore> ParallelShared<B> {
    fn on_handle_dropped(&self, id: &BlockId, block: &Arc<RwLock<Block>>) {
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(id) {
            entry.refs -= 1;
            if entry.refs == 0 {
                table.remove(id);
                // Write back before releasing the table lock so a
                // concurrent load of the same id cannot observe the stale
                // bytes still sitting in the layer below.
                let mut block = block.write();
                if block.is_dirty() {
                    match self.base.store(id, block.data()) {
                        Ok(()) => block.mark_clean(),
                        Err(e) => {
                            log::error!("write-back of block {id} on release failed: {e}");
                        }
                    }
                }
            }
        }
        drop(table);
        self.released.notify_all();
    }
}

/// Block store layer guaranteeing at most one in-memory instance per id.
pub struct ParallelAccessStore<B: BlockStore> {
    shared: Arc<ParallelShared<B>>,
}

impl<B: BlockStore> Clone for ParallelAccessStore<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: BlockStore> ParallelAccessStore<B> {
    pub fn new(base: B) -> Self {
        Self {
            shared: Arc::new(ParallelShared {
                base,
                table: Mutex::new(HashMap::new()),
                released: Condvar::new(),
            }),
        }
    }

    /// Create a block with a fresh random id holding `body`.
    ///
    /// Creation is eager: the body is persisted through the layers below
    /// before the handle is returned.
    pub fn create(&self, body: Vec<u8>) -> Result<BlockHandle<B>, StoreError> {
        loop {
            let id = BlockId::random();
            if self.shared.table.lock().contains_key(&id) {
                continue;
            }
            if !self.shared.base.try_create(&id, &body)? {
                // Id collision on the backend; draw a fresh one.
                continue;
            }
            let block = Arc::new(RwLock::new(Block::new(id, body)));
            let slot = Arc::new(Slot {
                state: Mutex::new(SlotState::Ready(block.clone())),
                ready: Condvar::new(),
            });
            self.shared
                .table
                .lock()
                .insert(id, TableEntry { slot, refs: 1 });
            return Ok(BlockHandle {
                id,
                block,
                shared: self.shared.clone(),
                detached: false,
            });
        }
    }

    /// Load a block, sharing the in-memory instance with any other holder.
    pub fn load(&self, id: &BlockId) -> Result<Option<BlockHandle<B>>, StoreError> {
        loop {
            let claim = {
                let mut table = self.shared.table.lock();
                match table.get_mut(id) {
                    Some(entry) => {
                        entry.refs += 1;
                        Claim::Join(entry.slot.clone())
                    }
                    None => {
                        let slot = Arc::new(Slot {
                            state: Mutex::new(SlotState::Loading),
                            ready: Condvar::new(),
                        });
                        table.insert(
                            *id,
                            TableEntry {
                                slot: slot.clone(),
                                refs: 1,
                            },
                        );
                        Claim::Lead(slot)
                    }
                }
            };
            match claim {
                Claim::Join(slot) => {
                    if let Some(block) = self.wait_for_slot(&slot) {
                        return Ok(Some(BlockHandle {
                            id: *id,
                            block,
                            shared: self.shared.clone(),
                            detached: false,
                        }));
                    }
                    // The loading arrival tore the entry down (missing or
                    // failed); our reference went with it. Retry fresh.
                }
                Claim::Lead(slot) => return self.lead_load(id, &slot),
            }
        }
    }

    fn wait_for_slot(&self, slot: &Arc<Slot>) -> Option<Arc<RwLock<Block>>> {
        let mut state = slot.state.lock();
        loop {
            match &*state {
                SlotState::Loading => slot.ready.wait(&mut state),
                SlotState::Ready(block) => return Some(block.clone()),
                SlotState::Missing | SlotState::Failed => return None,
            }
        }
    }

    /// First-arrival path: load below with no table lock held, then
    /// publish the result into the placeholder.
    fn lead_load(
        &self,
        id: &BlockId,
        slot: &Arc<Slot>,
    ) -> Result<Option<BlockHandle<B>>, StoreError> {
        match self.shared.base.load(id) {
            Ok(Some(body)) => {
                let block = Arc::new(RwLock::new(Block::new(*id, body)));
                *slot.state.lock() = SlotState::Ready(block.clone());
                slot.ready.notify_all();
                Ok(Some(BlockHandle {
                    id: *id,
                    block,
                    shared: self.shared.clone(),
                    detached: false,
                }))
            }
            Ok(None) => {
                self.tear_down(id, slot, SlotState::Missing);
                Ok(None)
            }
            Err(e) => {
                self.tear_down(id, slot, SlotState::Failed);
                Err(e)
            }
        }
    }

    fn tear_down(&self, id: &BlockId, slot: &Arc<Slot>, final_state: SlotState) {
        {
            let mut table = self.shared.table.lock();
            if let Some(entry) = table.get(id) {
                if Arc::ptr_eq(&entry.slot, slot) {
                    table.remove(id);
                }
            }
        }
        *slot.state.lock() = final_state;
        slot.ready.notify_all();
        self.shared.released.notify_all();
    }

    /// Remove a block the caller holds a handle to.
    ///
    /// Blocks until no other thread holds a handle for this id.
    pub fn remove(&self, handle: BlockHandle<B>) -> Result<bool, StoreError> {
        let id = handle.id;
        handle.detach();
        {
            let mut table = self.shared.table.lock();
            while table.get(&id).map_or(false, |entry| entry.refs > 1) {
                self.shared.released.wait(&mut table);
            }
            table.remove(&id);
        }
        let removed = self.shared.base.remove(&id)?;
        self.shared.released.notify_all();
        Ok(removed)
    }

    /// Remove a block by id, waiting for any outstanding handles first.
    pub fn remove_by_id(&self, id: &BlockId) -> Result<bool, StoreError> {
        {
            let mut table = self.shared.table.lock();
            while table.contains_key(id) {
                self.shared.released.wait(&mut table);
            }
        }
        self.shared.base.remove(id)
    }

    /// Write all open dirty blocks down and flush the layers below.
    pub fn flush(&self) -> Result<(), StoreError> {
        let open: Vec<(BlockId, Arc<RwLock<Block>>)> = {
            let table = self.shared.table.lock();
            table
                .iter()
                .filter_map(|(id, entry)| match &*entry.slot.state.lock() {
                    SlotState::Ready(block) => Some((*id, block.clone())),
                    _ => None,
                })
                .collect()
        };
        for (id, block) in open {
            let mut block = block.write();
            if block.is_dirty() {
                self.shared.base.store(&id, block.data())?;
                block.mark_clean();
            }
        }
        self.shared.base.flush()
    }

    pub fn num_blocks(&self) -> Result<u64, StoreError> {
        self.shared.base.num_blocks()
    }

    pub fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId)) -> Result<(), StoreError> {
        self.shared.base.for_each_block(callback)
    }

    pub fn estimate_free_bytes(&self) -> Result<u64, StoreError> {
        self.shared.base.estimate_free_bytes()
    }

    pub fn block_size_from_physical(&self, physical: u64) -> u64 {
        self.shared.base.block_size_from_physical(physical)
    }
}

/// Reference-counted, lock-guarded view of a block; the only way callers
/// touch block bodies.
pub struct BlockHandle<B: BlockStore> {
    id: BlockId,
    block: Arc<RwLock<Block>>,
    shared: Arc<ParallelShared<B>>,
    detached: bool,
}

impl<B: BlockStore> std::fmt::Debug for BlockHandle<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockHandle")
            .field("id", &self.id)
            .field("detached", &self.detached)
            .finish()
    }
}

impl<B: BlockStore> BlockHandle<B> {
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Shared read access to the block.
    pub fn read(&self) -> RwLockReadGuard<'_, Block> {
        self.block.read()
    }

    /// Exclusive write access to the block.
    pub fn write(&self) -> RwLockWriteGuard<'_, Block> {
        self.block.write()
    }

    /// Write the block down to the layer below if it is dirty.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut block = self.block.write();
        if block.is_dirty() {
            self.shared.base.store(&self.id, block.data())?;
            block.mark_clean();
        }
        Ok(())
    }

    /// Consume the handle without running the release path; used by
    /// `remove`, which takes over the entry.
    fn detach(mut self) {
        self.detached = true;
    }
}

impl<B: BlockStore> Drop for BlockHandle<B> {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        self.shared.on_handle_dropped(&self.id, &self.block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::InMemoryStore;
    use std::time::Duration;

    fn store() -> (InMemoryStore, ParallelAccessStore<InMemoryStore>) {
        let base = InMemoryStore::new();
        (base.clone(), ParallelAccessStore::new(base))
    }

    #[test]
    fn load_missing_returns_none() {
        let (_base, store) = store();
        assert!(store.load(&BlockId::random()).unwrap().is_none());
    }

    #[test]
    fn create_persists_eagerly() {
        let (base, store) = store();
        let handle = store.create(b"fresh body".to_vec()).unwrap();
        assert_eq!(base.raw_bytes(&handle.id()).unwrap(), b"fresh body");
        assert!(!handle.read().is_dirty());
    }

    #[test]
    fn handles_share_one_in_memory_body() {
        let (_base, store) = store();
        let first = store.create(vec![0u8; 8]).unwrap();
        let id = first.id();
        let second = store.load(&id).unwrap().unwrap();

        assert!(first.write().write_at(0, b"abc"));
        assert_eq!(second.read().read_at(0, 3).unwrap(), b"abc");
    }

    #[test]
    fn concurrent_loads_hit_the_base_store_once() {
        let (base, store) = store();
        let id = store.create(vec![7u8; 32]).unwrap().id();
        // Drop wrote nothing (clean), entry released.
        base.reset_counters();

        let barrier = std::sync::Barrier::new(8);
        let barrier = &barrier;
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let store = store.clone();
                scope.spawn(move || {
                    barrier.wait();
                    let handle = store.load(&id).unwrap().unwrap();
                    assert_eq!(handle.read().data(), &[7u8; 32]);
                    // Keep handles alive long enough to overlap.
                    std::thread::sleep(Duration::from_millis(100));
                });
            }
        });
        assert_eq!(base.load_count(), 1);
    }

    #[test]
    fn entry_is_released_when_last_handle_drops() {
        let (base, store) = store();
        let id = store.create(vec![1u8; 4]).unwrap().id();
        base.reset_counters();

        drop(store.load(&id).unwrap().unwrap());
        drop(store.load(&id).unwrap().unwrap());
        // Two separate load generations, two base loads.
        assert_eq!(base.load_count(), 2);
    }

    #[test]
    fn dirty_handle_writes_back_on_drop() {
        let (base, store) = store();
        let id = {
            let handle = store.create(vec![0u8; 4]).unwrap();
            assert!(handle.write().write_at(0, &[9, 9, 9, 9]));
            handle.id()
        };
        assert_eq!(base.raw_bytes(&id).unwrap(), &[9, 9, 9, 9]);
    }

    #[test]
    fn clean_handle_does_not_write_back() {
        let (base, store) = store();
        let id = store.create(vec![0u8; 4]).unwrap().id();
        base.reset_counters();
        drop(store.load(&id).unwrap().unwrap());
        assert_eq!(base.store_count(), 0);
    }

    #[test]
    fn resize_zero_fills_and_writes_back() {
        let (base, store) = store();
        let id = {
            let handle = store.create(vec![1u8; 2]).unwrap();
            handle.write().resize(5);
            handle.id()
        };
        assert_eq!(base.raw_bytes(&id).unwrap(), &[1, 1, 0, 0, 0]);
    }

    #[test]
    fn explicit_flush_propagates_writes() {
        let (base, store) = store();
        let handle = store.create(vec![0u8; 4]).unwrap();
        assert!(handle.write().write_at(0, &[5, 5, 5, 5]));
        handle.flush().unwrap();
        assert_eq!(base.raw_bytes(&handle.id()).unwrap(), &[5, 5, 5, 5]);
        assert!(!handle.read().is_dirty());
    }

    #[test]
    fn store_flush_covers_open_handles() {
        let (base, store) = store();
        let handle = store.create(vec![0u8; 4]).unwrap();
        assert!(handle.write().write_at(0, &[3, 3, 3, 3]));
        store.flush().unwrap();
        assert_eq!(base.raw_bytes(&handle.id()).unwrap(), &[3, 3, 3, 3]);
    }

    #[test]
    fn remove_deletes_from_base() {
        let (base, store) = store();
        let handle = store.create(vec![0u8; 4]).unwrap();
        let id = handle.id();
        assert!(store.remove(handle).unwrap());
        assert!(base.raw_bytes(&id).is_none());
        assert!(store.load(&id).unwrap().is_none());
    }

    #[test]
    fn remove_waits_for_other_holders() {
        let (base, store) = store();
        let handle = store.create(vec![0u8; 4]).unwrap();
        let id = handle.id();

        std::thread::scope(|scope| {
            let other = store.load(&id).unwrap().unwrap();
            let store_ref = store.clone();
            let remover = scope.spawn(move || store_ref.remove(handle).unwrap());
            std::thread::sleep(Duration::from_millis(30));
            assert!(!remover.is_finished());
            drop(other);
            assert!(remover.join().unwrap());
        });
        assert!(base.raw_bytes(&id).is_none());
    }

    #[test]
    fn remove_by_id_works_without_handles() {
        let (_base, store) = store();
        let id = store.create(vec![0u8; 4]).unwrap().id();
        assert!(store.remove_by_id(&id).unwrap());
        assert!(!store.remove_by_id(&id).unwrap());
    }

    #[test]
    fn num_blocks_counts_created_blocks() {
        let (_base, store) = store();
        let a = store.create(vec![0u8; 1]).unwrap().id();
        let _b = store.create(vec![0u8; 1]).unwrap().id();
        assert_eq!(store.num_blocks().unwrap(), 2);
        store.remove_by_id(&a).unwrap();
        assert_eq!(store.num_blocks().unwrap(), 1);
    }
}
