//! Bounded write-back cache over a block store.
//!
//! The cache keeps up to `max_cache_entries` block bodies in memory.
//! Plain `store` calls are deferred; a dedicated flusher thread writes
//! entries back once they have been idle for `flush_after_idle`, and
//! eviction of a dirty least-recently-used entry writes it back
//! synchronously. Block creation is eager: `try_create` writes through to
//! the base store and only seeds the cache with a clean copy, so the base
//! store's block count stays authoritative.
//!
//! A failed write-back leaves the entry dirty and surfaces the error (or
//! logs it, on the background path); the cache never silently loses data.
//!
//! The cache sits below the parallel-access layer, so per-id exclusion is
//! already guaranteed by the caller. The internal mutex only protects the
//! map itself and is never held across base-store I/O; write-backs compare
//! a per-entry generation counter afterwards so an entry re-dirtied during
//! the write stays dirty.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use zeroize::Zeroize;

use crate::block_id::BlockId;
use crate::config::StorageConfig;
use crate::error::StoreError;
use crate::store::BlockStore;

struct CacheEntry {
    body: Vec<u8>,
    dirty: bool,
    last_access: Instant,
    generation: u64,
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        self.body.zeroize();
    }
}

struct CacheShared<B: BlockStore> {
    base: B,
    entries: Mutex<LruCache<BlockId, CacheEntry>>,
    next_generation: AtomicU64,
    stop: Mutex<bool>,
    wakeup: Condvar,
    max_entries: usize,
    flush_after_idle: Duration,
}

impl<B: BlockStore> CacheShared<B> {
    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    fn insert(&self, id: BlockId, body: Vec<u8>, dirty: bool) -> Result<(), StoreError> {
        let entry = CacheEntry {
            body,
            dirty,
            last_access: Instant::now(),
            generation: self.next_generation(),
        };
        self.entries.lock().push(id, entry);
        self.evict_to_capacity()
    }

    /// Shrink the cache back to its bound, writing back dirty victims.
    fn evict_to_capacity(&self) -> Result<(), StoreError> {
        loop {
            let (id, body, generation) = {
                let mut entries = self.entries.lock();
                if entries.len() <= self.max_entries {
                    return Ok(());
                }
                let (id, dirty, body, generation) = match entries.peek_lru() {
                    Some((id, e)) => (*id, e.dirty, e.body.clone(), e.generation),
                    None => return Ok(()),
                };
                if !dirty {
                    entries.pop(&id);
                    continue;
                }
                (id, body, generation)
            };
            self.base.store(&id, &body)?;
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.peek_mut(&id) {
                // Drop the entry only if nobody touched it while we wrote.
                if entry.generation == generation {
                    entries.pop(&id);
                }
            }
        }
    }

    /// Write dirty entries back, keeping them cached as clean.
    ///
    /// With `only_idle`, restricts to entries untouched for at least
    /// `flush_after_idle`. Entries whose write-back fails stay dirty.
    fn write_back(&self, only_idle: bool) -> Result<(), StoreError> {
        let candidates: Vec<(BlockId, Vec<u8>, u64)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(_, e)| {
                    e.dirty && (!only_idle || e.last_access.elapsed() >= self.flush_after_idle)
                })
                .map(|(id, e)| (*id, e.body.clone(), e.generation))
                .collect()
        };
        let mut first_err = None;
        for (id, body, generation) in candidates {
            match self.base.store(&id, &body) {
                Ok(()) => {
                    let mut entries = self.entries.lock();
                    if let Some(entry) = entries.peek_mut(&id) {
                        if entry.generation == generation {
                            entry.dirty = false;
                        }
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    } else {
                        log::warn!("write-back of block {id} failed: {e}");
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Block store transformer adding a bounded write-back cache.
pub struct CachingStore<B: BlockStore> {
    shared: Arc<CacheShared<B>>,
    flusher: Option<JoinHandle<()>>,
}

impl<B: BlockStore + 'static> CachingStore<B> {
    pub fn new(base: B, config: &StorageConfig) -> Result<Self, StoreError> {
        let shared = Arc::new(CacheShared {
            base,
            entries: Mutex::new(LruCache::unbounded()),
            next_generation: AtomicU64::new(0),
            stop: Mutex::new(false),
            wakeup: Condvar::new(),
            max_entries: NonZeroUsize::new(config.max_cache_entries)
                .unwrap_or(NonZeroUsize::MIN)
                .get(),
            flush_after_idle: config.flush_after_idle,
        });
        let flusher = Self::spawn_flusher(shared.clone(), config.cache_sweep_interval)?;
        Ok(Self {
            shared,
            flusher: Some(flusher),
        })
    }

    fn spawn_flusher(
        shared: Arc<CacheShared<B>>,
        sweep_interval: Duration,
    ) -> Result<JoinHandle<()>, StoreError> {
        std::thread::Builder::new()
            .name("veilfs-cache-flusher".to_string())
            .spawn(move || loop {
                {
                    let mut stop = shared.stop.lock();
                    if *stop {
                        break;
                    }
                    let _ = shared.wakeup.wait_for(&mut stop, sweep_interval);
                    if *stop {
                        break;
                    }
                }
                if let Err(e) = shared.write_back(true) {
                    log::warn!("background cache write-back failed: {e}");
                }
            })
            .map_err(|e| StoreError::io("spawn cache flusher thread", e))
    }
}

impl<B: BlockStore> Drop for CachingStore<B> {
    fn drop(&mut self) {
        *self.shared.stop.lock() = true;
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
        if let Err(e) = self.shared.write_back(false) {
            log::error!("final cache flush failed, dirty blocks lost: {e}");
        }
    }
}

impl<B: BlockStore> BlockStore for CachingStore<B> {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool, StoreError> {
        if self.shared.entries.lock().contains(id) {
            return Ok(false);
        }
        if !self.shared.base.try_create(id, data)? {
            return Ok(false);
        }
        self.shared.insert(*id, data.to_vec(), false)?;
        Ok(true)
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<(), StoreError> {
        {
            let mut entries = self.shared.entries.lock();
            if let Some(entry) = entries.get_mut(id) {
                entry.body.zeroize();
                entry.body = data.to_vec();
                entry.dirty = true;
                entry.last_access = Instant::now();
                entry.generation = self.shared.next_generation();
                return Ok(());
            }
        }
        self.shared.insert(*id, data.to_vec(), true)
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>, StoreError> {
        {
            let mut entries = self.shared.entries.lock();
            if let Some(entry) = entries.get_mut(id) {
                entry.last_access = Instant::now();
                return Ok(Some(entry.body.clone()));
            }
        }
        let Some(body) = self.shared.base.load(id)? else {
            return Ok(None);
        };
        self.shared.insert(*id, body.clone(), false)?;
        Ok(Some(body))
    }

    fn remove(&self, id: &BlockId) -> Result<bool, StoreError> {
        // A cached entry is discarded without write-back; the block is
        // going away anyway.
        self.shared.entries.lock().pop(id);
        self.shared.base.remove(id)
    }

    fn num_blocks(&self) -> Result<u64, StoreError> {
        self.shared.base.num_blocks()
    }

    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId)) -> Result<(), StoreError> {
        self.shared.base.for_each_block(callback)
    }

    fn estimate_free_bytes(&self) -> Result<u64, StoreError> {
        self.shared.base.estimate_free_bytes()
    }

    fn block_size_from_physical(&self, physical: u64) -> u64 {
        self.shared.base.block_size_from_physical(physical)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.shared.write_back(false)?;
        self.shared.base.flush()
    }
}
