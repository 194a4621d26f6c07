//! The block store contract.
//!
//! Every layer of the stack either implements this trait over ciphertext
//! or plaintext bytes (base stores, integrity, caching) or consumes a value
//! of it as its inner store. The stack is composed bottom-up at
//! construction time with static dispatch; only the topmost boundary the
//! filesystem layer sees needs dynamic dispatch, if at all.

use crate::block_id::BlockId;
use crate::error::StoreError;

/// Fixed-size, addressable, mutable block storage.
///
/// Absence is not an error: `load` returns `Ok(None)` and `try_create`
/// returns `Ok(false)`. All methods take `&self`; implementations use
/// interior mutability so a store can be shared across threads.
pub trait BlockStore: Send + Sync {
    /// Write `data` under `id` only if no block with this id exists.
    /// Returns whether the block was created.
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool, StoreError>;

    /// Unconditionally overwrite the block under `id`.
    fn store(&self, id: &BlockId, data: &[u8]) -> Result<(), StoreError>;

    /// Load the current bytes of the block, or `None` if it does not exist.
    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>, StoreError>;

    /// Remove the block. Returns whether a block existed.
    fn remove(&self, id: &BlockId) -> Result<bool, StoreError>;

    /// Number of blocks currently stored.
    fn num_blocks(&self) -> Result<u64, StoreError>;

    /// Invoke `callback` once per stored block id, in unspecified order.
    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId)) -> Result<(), StoreError>;

    /// Estimate of the free bytes left on the backend.
    fn estimate_free_bytes(&self) -> Result<u64, StoreError>;

    /// Usable payload size of a block whose physical size is `physical`,
    /// with this layer's (and all lower layers') overhead removed.
    fn block_size_from_physical(&self, physical: u64) -> u64;

    /// Push all deferred state down to the backend.
    fn flush(&self) -> Result<(), StoreError>;
}
