//! Rollback and re-introduction detection.
//!
//! The integrity layer keeps a table of the last `(version, client_id)`
//! pair observed per block id. A load whose version is older than the
//! recorded one for the same client means someone restored an earlier
//! ciphertext; a load of a missing-but-known block can optionally be
//! treated the same way. The table is mirrored to a side file on every
//! modifying operation, written atomically via temp-then-rename.
//!
//! Table file format:
//!
//! ```text
//! [ magic "cryfs;int;0\0" ][ (16 B BlockId, u64 LE version, u32 LE client_id)* ]
//! ```
//!
//! Entries are sorted by block id. A present-but-unreadable table file
//! rejects startup; silently starting with an empty table would erase the
//! very history rollback detection depends on.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::block_id::{BlockId, BLOCK_ID_SIZE};
use crate::crypto::BlockHeader;
use crate::encrypted::VersionedBlockStore;
use crate::error::{IntegrityViolationKind, StoreError};
use crate::store::BlockStore;

/// Magic bytes at the start of the table file, null terminator included.
pub const TABLE_MAGIC: &[u8] = b"cryfs;int;0\0";

/// File name of the table inside the store root directory.
pub const STATE_FILE_NAME: &str = "integrity-state";

const ENTRY_SIZE: usize = BLOCK_ID_SIZE + 8 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TableEntry {
    version: u64,
    client_id: u32,
}

/// Persistent map of the last seen `(version, client_id)` per block id.
pub struct KnownBlockTable {
    path: Option<PathBuf>,
    entries: BTreeMap<BlockId, TableEntry>,
}

impl KnownBlockTable {
    /// Open the table file at `path`, or start empty if it does not exist.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Self {
                    path: Some(path),
                    entries: BTreeMap::new(),
                })
            }
            Err(e) => {
                return Err(StoreError::io(
                    format!("read integrity state {}", path.display()),
                    e,
                ))
            }
        };
        let entries = Self::parse(&data)?;
        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    /// A table that is never persisted, for in-memory stacks and tests.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: BTreeMap::new(),
        }
    }

    fn parse(data: &[u8]) -> Result<BTreeMap<BlockId, TableEntry>, StoreError> {
        if data.len() < TABLE_MAGIC.len() || data[..TABLE_MAGIC.len()] != *TABLE_MAGIC {
            return Err(StoreError::BadIntegrityState(
                "missing or unknown magic".to_string(),
            ));
        }
        let body = &data[TABLE_MAGIC.len()..];
        if body.len() % ENTRY_SIZE != 0 {
            return Err(StoreError::BadIntegrityState(format!(
                "truncated entry list ({} trailing bytes)",
                body.len() % ENTRY_SIZE
            )));
        }
        let mut entries = BTreeMap::new();
        for chunk in body.chunks_exact(ENTRY_SIZE) {
            let id = BlockId::from_slice(&chunk[..BLOCK_ID_SIZE]).ok_or_else(|| {
                StoreError::BadIntegrityState("malformed block id".to_string())
            })?;
            let version = u64::from_le_bytes(
                chunk[BLOCK_ID_SIZE..BLOCK_ID_SIZE + 8]
                    .try_into()
                    .map_err(|_| StoreError::BadIntegrityState("malformed version".to_string()))?,
            );
            let client_id = u32::from_le_bytes(
                chunk[BLOCK_ID_SIZE + 8..]
                    .try_into()
                    .map_err(|_| StoreError::BadIntegrityState("malformed client id".to_string()))?,
            );
            entries.insert(id, TableEntry { version, client_id });
        }
        Ok(entries)
    }

    fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(TABLE_MAGIC.len() + self.entries.len() * ENTRY_SIZE);
        data.extend_from_slice(TABLE_MAGIC);
        for (id, entry) in &self.entries {
            data.extend_from_slice(id.as_bytes());
            data.extend_from_slice(&entry.version.to_le_bytes());
            data.extend_from_slice(&entry.client_id.to_le_bytes());
        }
        data
    }

    /// Atomically mirror the table to its file, if it has one.
    pub fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.serialize())
            .map_err(|e| StoreError::io(format!("write integrity state {}", tmp.display()), e))?;
        fs::rename(&tmp, path)
            .map_err(|e| StoreError::io(format!("rename integrity state {}", path.display()), e))
    }

    /// Last seen `(version, client_id)` for an id, if any.
    #[must_use]
    pub fn last_seen(&self, id: &BlockId) -> Option<(u64, u32)> {
        self.entries.get(id).map(|e| (e.version, e.client_id))
    }

    #[must_use]
    pub fn knows(&self, id: &BlockId) -> bool {
        self.entries.contains_key(id)
    }

    /// Highest version on record across all ids and clients.
    #[must_use]
    pub fn max_version(&self) -> u64 {
        self.entries.values().map(|e| e.version).max().unwrap_or(0)
    }

    /// Validate a load against the table and record the observation.
    ///
    /// Same client: the version must not go backwards (equality is the
    /// normal re-read of the ciphertext we stored last). Different client:
    /// any version is accepted and recorded. Returns whether the table
    /// changed.
    fn check_and_update_on_load(
        &mut self,
        id: &BlockId,
        header: &BlockHeader,
    ) -> Result<bool, StoreError> {
        match self.entries.get_mut(id) {
            Some(entry) if entry.client_id == header.client_id => {
                if header.version < entry.version {
                    return Err(StoreError::integrity(*id, IntegrityViolationKind::Rollback));
                }
                let changed = header.version > entry.version;
                entry.version = header.version;
                Ok(changed)
            }
            Some(entry) => {
                entry.version = header.version;
                entry.client_id = header.client_id;
                Ok(true)
            }
            None => {
                self.entries.insert(
                    *id,
                    TableEntry {
                        version: header.version,
                        client_id: header.client_id,
                    },
                );
                Ok(true)
            }
        }
    }

    /// Record the header of a block we just wrote.
    fn record_store(&mut self, id: &BlockId, header: &BlockHeader) {
        self.entries.insert(
            *id,
            TableEntry {
                version: header.version,
                client_id: header.client_id,
            },
        );
    }

    /// Forget an id, or keep a tombstone under the missing-block policy.
    ///
    /// The tombstone bumps the recorded version by one, so re-introducing
    /// any previously seen ciphertext for this id fails the rollback
    /// check. Returns whether the table changed.
    fn on_remove(&mut self, id: &BlockId, keep_tombstone: bool) -> bool {
        if keep_tombstone {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.version = entry.version.saturating_add(1);
                return true;
            }
            false
        } else {
            self.entries.remove(id).is_some()
        }
    }
}

/// Block store transformer detecting rollback, swap re-introduction and
/// disappearance of known blocks.
pub struct IntegrityStore<S: VersionedBlockStore> {
    base: S,
    table: Mutex<KnownBlockTable>,
    missing_block_is_violation: bool,
}

impl<S: VersionedBlockStore> IntegrityStore<S> {
    /// Wrap `base` with the given table.
    ///
    /// Seeds the base store's version counter past everything on record so
    /// versions stay monotonic across restarts.
    pub fn new(base: S, table: KnownBlockTable, missing_block_is_violation: bool) -> Self {
        base.bump_version_floor(table.max_version() + 1);
        Self {
            base,
            table: Mutex::new(table),
            missing_block_is_violation,
        }
    }
}

impl<S: VersionedBlockStore> BlockStore for IntegrityStore<S> {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool, StoreError> {
        let Some(header) = self.base.try_create(id, data)? else {
            return Ok(false);
        };
        let mut table = self.table.lock();
        table.record_store(id, &header);
        table.persist()?;
        Ok(true)
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<(), StoreError> {
        let header = self.base.store(id, data)?;
        let mut table = self.table.lock();
        table.record_store(id, &header);
        table.persist()
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(unsealed) = self.base.load(id)? else {
            if self.missing_block_is_violation && self.table.lock().knows(id) {
                return Err(StoreError::integrity(
                    *id,
                    IntegrityViolationKind::MissingBlock,
                ));
            }
            return Ok(None);
        };
        let mut table = self.table.lock();
        let changed = table.check_and_update_on_load(id, &unsealed.header)?;
        if changed {
            table.persist()?;
        }
        Ok(Some(unsealed.body))
    }

    fn remove(&self, id: &BlockId) -> Result<bool, StoreError> {
        let removed = self.base.remove(id)?;
        let mut table = self.table.lock();
        if table.on_remove(id, self.missing_block_is_violation) {
            table.persist()?;
        }
        Ok(removed)
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
        self.base.block_size_from_physical(physical)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.base.flush()
    }
}
