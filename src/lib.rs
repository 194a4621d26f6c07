//! VeilFS Storage - encrypted block and blob layer
//!
//! This crate is the storage core of the VeilFS encrypting filesystem. It
//! turns an untrusted backend (a directory of opaque files) into
//! authenticated, freshness-checked, resizable byte sequences:
//! - Fixed-size blocks, individually encrypted with AES-256-GCM
//! - Rollback/swap/tamper detection via a persistent known-block table
//! - Bounded write-back caching with a background flusher
//! - At most one in-memory instance per block, shared across threads
//! - Arbitrarily large blobs as balanced trees of blocks
//!
//! ## Architecture
//!
//! ```text
//! Filesystem layer (inodes, dentries - not in this crate)
//!     ↓ blobs: create/load/remove, read/write/resize
//! BlobStore (balanced k-ary block tree)
//!     ↓ block handles
//! ParallelAccessStore (one in-memory body per id, rw-lock per entry)
//!     ↓ plaintext blocks
//! CachingStore (bounded write-back cache + background flusher)
//!     ↓ plaintext blocks
//! IntegrityStore (known-block table: rollback & missing-block checks)
//!     ↓ sealed blocks + version headers
//! EncryptedStore (AES-256-GCM, id bound into the ciphertext)
//!     ↓ ciphertext
//! OnDiskStore / InMemoryStore (format header, <root>/<prefix>/<rest>)
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod blob;
pub mod block_id;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod encrypted;
pub mod error;
pub mod integrity;
pub mod memstore;
pub mod ondisk;
pub mod parallel;
pub mod stack;
pub mod store;

pub use blob::{Blob, BlobStore};
pub use block_id::{BlockId, BLOCK_ID_SIZE};
pub use cache::CachingStore;
pub use config::StorageConfig;
pub use crypto::{BlockHeader, EncryptionKey, KEY_SIZE};
pub use encrypted::{EncryptedStore, VersionedBlockStore};
pub use error::{IntegrityViolationKind, StoreError};
pub use integrity::{IntegrityStore, KnownBlockTable, STATE_FILE_NAME};
pub use memstore::InMemoryStore;
pub use ondisk::{OnDiskStore, FORMAT_VERSION_HEADER, FORMAT_VERSION_HEADER_SIZE};
pub use parallel::{Block, BlockHandle, ParallelAccessStore};
pub use stack::{
    open_disk_blob_store, open_disk_stack, open_memory_blob_store, open_memory_stack,
    DiskBlockStack, MemoryBlockStack,
};
pub use store::BlockStore;
