//! On-disk base store.
//!
//! Blocks live under a root directory, one subdirectory per 3-hex-char id
//! prefix, one file per block named by the remaining 29 hex chars:
//!
//! ```text
//! <root>/1a2/b3c4d5e6f708192a3b4c5d6e7f8091a
//! ```
//!
//! Every file starts with a fixed format-version header so future format
//! revisions can be told apart from arbitrary foreign files. The header is
//! this layer's only framing; everything after it is opaque ciphertext
//! supplied by the layers above.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::block_id::{BlockId, BLOCK_ID_HEX_LEN};
use crate::error::{IntegrityViolationKind, StoreError};
use crate::store::BlockStore;

/// Format header written in front of every block file, null terminator
/// included.
pub const FORMAT_VERSION_HEADER: &[u8] = b"cryfs;block;0\0";

/// Prefix shared by all format versions of this store.
pub const FORMAT_VERSION_HEADER_PREFIX: &[u8] = b"cryfs;block;";

/// Size of the format header in bytes.
pub const FORMAT_VERSION_HEADER_SIZE: usize = 14;

/// Number of hex chars used as the subdirectory name.
const PREFIX_LEN: usize = 3;

/// Base store persisting blocks as individual files.
pub struct OnDiskStore {
    root: PathBuf,
}

impl OnDiskStore {
    /// Open (creating if necessary) the block directory at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| StoreError::io(format!("create block directory {}", root.display()), e))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, id: &BlockId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..PREFIX_LEN]).join(&hex[PREFIX_LEN..])
    }

    fn check_and_strip_header(id: &BlockId, data: Vec<u8>) -> Result<Vec<u8>, StoreError> {
        if data.len() >= FORMAT_VERSION_HEADER_SIZE
            && data[..FORMAT_VERSION_HEADER_SIZE] == *FORMAT_VERSION_HEADER
        {
            return Ok(data[FORMAT_VERSION_HEADER_SIZE..].to_vec());
        }
        let kind = if data.len() >= FORMAT_VERSION_HEADER_PREFIX.len()
            && data[..FORMAT_VERSION_HEADER_PREFIX.len()] == *FORMAT_VERSION_HEADER_PREFIX
        {
            IntegrityViolationKind::UnsupportedFormat
        } else {
            IntegrityViolationKind::NotABlock
        };
        Err(StoreError::integrity(*id, kind))
    }

    /// Parse a (subdirectory, file name) pair back into a block id.
    fn id_from_path(prefix: &str, rest: &str) -> Option<BlockId> {
        if prefix.len() != PREFIX_LEN || rest.len() != BLOCK_ID_HEX_LEN - PREFIX_LEN {
            return None;
        }
        let mut hex = String::with_capacity(BLOCK_ID_HEX_LEN);
        hex.push_str(prefix);
        hex.push_str(rest);
        BlockId::from_hex(&hex)
    }

    fn visit_blocks(
        &self,
        callback: &mut dyn FnMut(&BlockId),
    ) -> Result<(), StoreError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| StoreError::io(format!("list block directory {}", self.root.display()), e))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| StoreError::io("read block directory entry", e))?;
            let prefix = entry.file_name();
            let Some(prefix) = prefix.to_str() else {
                continue;
            };
            if prefix.len() != PREFIX_LEN || !entry.path().is_dir() {
                continue;
            }
            let files = fs::read_dir(entry.path())
                .map_err(|e| StoreError::io("list block prefix directory", e))?;
            for file in files {
                let file = file.map_err(|e| StoreError::io("read block file entry", e))?;
                let name = file.file_name();
                let Some(rest) = name.to_str() else {
                    continue;
                };
                if let Some(id) = Self::id_from_path(prefix, rest) {
                    callback(&id);
                }
            }
        }
        Ok(())
    }
}

impl BlockStore for OnDiskStore {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool, StoreError> {
        if self.file_path(id).exists() {
            return Ok(false);
        }
        self.store(id, data)?;
        Ok(true)
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<(), StoreError> {
        let path = self.file_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::io(format!("create prefix directory for {id}"), e))?;
        }
        let mut contents = Vec::with_capacity(FORMAT_VERSION_HEADER_SIZE + data.len());
        contents.extend_from_slice(FORMAT_VERSION_HEADER);
        contents.extend_from_slice(data);
        fs::write(&path, contents).map_err(|e| StoreError::io(format!("write block {id}"), e))
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.file_path(id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(format!("read block {id}"), e)),
        };
        Self::check_and_strip_header(id, data).map(Some)
    }

    fn remove(&self, id: &BlockId) -> Result<bool, StoreError> {
        let path = self.file_path(id);
        if !path.is_file() {
            return Ok(false);
        }
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Raced with another remove.
                log::warn!("block {id} vanished before it could be removed");
                return Ok(false);
            }
            Err(e) => return Err(StoreError::io(format!("remove block {id}"), e)),
        }
        if let Some(parent) = path.parent() {
            let empty = fs::read_dir(parent)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if empty {
                let _ = fs::remove_dir(parent);
            }
        }
        Ok(true)
    }

    fn num_blocks(&self) -> Result<u64, StoreError> {
        let mut count = 0u64;
        self.visit_blocks(&mut |_| count += 1)?;
        Ok(count)
    }

    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId)) -> Result<(), StoreError> {
        self.visit_blocks(callback)
    }

    fn estimate_free_bytes(&self) -> Result<u64, StoreError> {
        fs2::available_space(&self.root)
            .map_err(|e| StoreError::io(format!("statvfs {}", self.root.display()), e))
    }

    fn block_size_from_physical(&self, physical: u64) -> u64 {
        physical.saturating_sub(FORMAT_VERSION_HEADER_SIZE as u64)
    }

    fn flush(&self) -> Result<(), StoreError> {
        // Files are written eagerly; nothing is deferred at this layer.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, OnDiskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = OnDiskStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn roundtrip() {
        let (_dir, store) = store();
        let id = BlockId::random();
        store.store(&id, b"ciphertext bytes").unwrap();
        assert_eq!(store.load(&id).unwrap().unwrap(), b"ciphertext bytes");
    }

    #[test]
    fn load_missing_returns_none() {
        let (_dir, store) = store();
        assert!(store.load(&BlockId::random()).unwrap().is_none());
    }

    #[test]
    fn file_lands_under_prefix_directory() {
        let (dir, store) = store();
        let id = BlockId::random();
        store.store(&id, b"x").unwrap();
        let hex = id.to_hex();
        let path = dir.path().join(&hex[..3]).join(&hex[3..]);
        assert!(path.is_file());
    }

    #[test]
    fn file_starts_with_format_header() {
        let (dir, store) = store();
        let id = BlockId::random();
        store.store(&id, b"payload").unwrap();
        let hex = id.to_hex();
        let raw = fs::read(dir.path().join(&hex[..3]).join(&hex[3..])).unwrap();
        assert_eq!(&raw[..FORMAT_VERSION_HEADER_SIZE], FORMAT_VERSION_HEADER);
        assert_eq!(&raw[FORMAT_VERSION_HEADER_SIZE..], b"payload");
    }

    #[test]
    fn try_create_refuses_existing_id() {
        let (_dir, store) = store();
        let id = BlockId::random();
        assert!(store.try_create(&id, b"a").unwrap());
        assert!(!store.try_create(&id, b"b").unwrap());
        assert_eq!(store.load(&id).unwrap().unwrap(), b"a");
    }

    #[test]
    fn remove_deletes_file_and_empty_prefix_dir() {
        let (dir, store) = store();
        let id = BlockId::random();
        store.store(&id, b"x").unwrap();
        assert!(store.remove(&id).unwrap());
        assert!(!store.remove(&id).unwrap());
        let hex = id.to_hex();
        assert!(!dir.path().join(&hex[..3]).exists());
    }

    #[test]
    fn newer_format_version_is_unsupported() {
        let (dir, store) = store();
        let id = BlockId::random();
        store.store(&id, b"payload").unwrap();
        let hex = id.to_hex();
        let path = dir.path().join(&hex[..3]).join(&hex[3..]);
        let mut raw = fs::read(&path).unwrap();
        raw[12] = b'9'; // version digit inside the header
        fs::write(&path, raw).unwrap();
        match store.load(&id) {
            Err(StoreError::IntegrityViolation { kind, .. }) => {
                assert_eq!(kind, IntegrityViolationKind::UnsupportedFormat);
            }
            other => panic!("expected UnsupportedFormat, got {other:?}"),
        }
    }

    #[test]
    fn foreign_file_is_not_a_block() {
        let (dir, store) = store();
        let id = BlockId::random();
        let hex = id.to_hex();
        let prefix = dir.path().join(&hex[..3]);
        fs::create_dir_all(&prefix).unwrap();
        fs::write(prefix.join(&hex[3..]), b"random junk, no header").unwrap();
        match store.load(&id) {
            Err(StoreError::IntegrityViolation { kind, .. }) => {
                assert_eq!(kind, IntegrityViolationKind::NotABlock);
            }
            other => panic!("expected NotABlock, got {other:?}"),
        }
    }

    #[test]
    fn num_blocks_and_for_each_agree() {
        let (_dir, store) = store();
        let mut expected = std::collections::HashSet::new();
        for _ in 0..5 {
            let id = BlockId::random();
            store.store(&id, b"x").unwrap();
            expected.insert(id);
        }
        assert_eq!(store.num_blocks().unwrap(), 5);
        let mut seen = std::collections::HashSet::new();
        store
            .for_each_block(&mut |id| {
                seen.insert(*id);
            })
            .unwrap();
        assert_eq!(seen, expected);
    }

    #[test]
    fn foreign_files_in_root_are_ignored_by_iteration() {
        let (dir, store) = store();
        fs::write(dir.path().join("integrity-state"), b"not a block").unwrap();
        let id = BlockId::random();
        store.store(&id, b"x").unwrap();
        assert_eq!(store.num_blocks().unwrap(), 1);
    }

    #[test]
    fn block_size_from_physical_strips_header() {
        let (_dir, store) = store();
        assert_eq!(store.block_size_from_physical(1024), 1024 - 14);
        assert_eq!(store.block_size_from_physical(4), 0);
    }

    #[test]
    fn estimate_free_bytes_reports_something() {
        let (_dir, store) = store();
        assert!(store.estimate_free_bytes().unwrap() > 0);
    }
}
