//! Storage configuration.
//!
//! All options are fixed at construction time of the store stack; nothing
//! here is mutated while the stack is live.

use std::time::Duration;

use crate::crypto::SEALED_OVERHEAD;
use crate::error::StoreError;
use crate::ondisk::FORMAT_VERSION_HEADER_SIZE;

/// Default physical block size: 32 KiB.
pub const DEFAULT_BLOCK_SIZE_BYTES: usize = 32 * 1024;

/// Default bound on the number of cached block bodies.
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 1000;

/// Default idle time after which a dirty cache entry is written back.
pub const DEFAULT_FLUSH_AFTER_IDLE: Duration = Duration::from_secs(5);

/// Default wakeup interval of the background cache flusher.
pub const DEFAULT_CACHE_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration consumed by the store stack.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Upper bound on the number of in-memory cache entries.
    pub max_cache_entries: usize,
    /// Idle time after which a dirty cache entry is written back.
    pub flush_after_idle: Duration,
    /// Wakeup interval of the background cache flusher.
    pub cache_sweep_interval: Duration,
    /// Identifier of this writer; must be non-zero.
    pub client_id: u32,
    /// Treat the disappearance of a known block as an attack instead of
    /// a plain "not found".
    pub missing_block_is_integrity_violation: bool,
    /// Physical size of a block on the backend, including all headers.
    pub block_size_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_cache_entries: DEFAULT_MAX_CACHE_ENTRIES,
            flush_after_idle: DEFAULT_FLUSH_AFTER_IDLE,
            cache_sweep_interval: DEFAULT_CACHE_SWEEP_INTERVAL,
            client_id: 1,
            missing_block_is_integrity_violation: false,
            block_size_bytes: DEFAULT_BLOCK_SIZE_BYTES,
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: u32) -> Self {
        self.client_id = client_id;
        self
    }

    #[must_use]
    pub fn with_block_size_bytes(mut self, block_size_bytes: usize) -> Self {
        self.block_size_bytes = block_size_bytes;
        self
    }

    #[must_use]
    pub fn with_max_cache_entries(mut self, max_cache_entries: usize) -> Self {
        self.max_cache_entries = max_cache_entries;
        self
    }

    #[must_use]
    pub fn with_flush_after_idle(mut self, flush_after_idle: Duration) -> Self {
        self.flush_after_idle = flush_after_idle;
        self
    }

    #[must_use]
    pub fn with_cache_sweep_interval(mut self, cache_sweep_interval: Duration) -> Self {
        self.cache_sweep_interval = cache_sweep_interval;
        self
    }

    #[must_use]
    pub fn with_missing_block_is_integrity_violation(mut self, enabled: bool) -> Self {
        self.missing_block_is_integrity_violation = enabled;
        self
    }

    /// Plaintext bytes available per block after the on-disk format header
    /// and the sealing overhead are paid.
    #[must_use]
    pub fn plaintext_block_capacity(&self) -> usize {
        self.block_size_bytes
            .saturating_sub(FORMAT_VERSION_HEADER_SIZE + SEALED_OVERHEAD)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.client_id == 0 {
            return Err(StoreError::InvariantViolation(
                "client_id must be non-zero".to_string(),
            ));
        }
        if self.max_cache_entries == 0 {
            return Err(StoreError::InvariantViolation(
                "max_cache_entries must be at least 1".to_string(),
            ));
        }
        // A block must fit an inner node with at least two children,
        // otherwise the blob tree cannot branch.
        let capacity = self.plaintext_block_capacity();
        if capacity < 64 {
            return Err(StoreError::InvariantViolation(format!(
                "block_size_bytes {} leaves only {} plaintext bytes per block",
                self.block_size_bytes, capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = StorageConfig::default();
        config.validate().unwrap();
        assert_eq!(config.block_size_bytes, 32 * 1024);
        assert_eq!(config.max_cache_entries, 1000);
        assert_eq!(config.client_id, 1);
        assert!(!config.missing_block_is_integrity_violation);
    }

    #[test]
    fn builders_set_fields() {
        let config = StorageConfig::new()
            .with_client_id(7)
            .with_block_size_bytes(4096)
            .with_max_cache_entries(10)
            .with_flush_after_idle(Duration::from_millis(100))
            .with_cache_sweep_interval(Duration::from_millis(20))
            .with_missing_block_is_integrity_violation(true);
        assert_eq!(config.client_id, 7);
        assert_eq!(config.block_size_bytes, 4096);
        assert_eq!(config.max_cache_entries, 10);
        assert_eq!(config.flush_after_idle, Duration::from_millis(100));
        assert_eq!(config.cache_sweep_interval, Duration::from_millis(20));
        assert!(config.missing_block_is_integrity_violation);
    }

    #[test]
    fn zero_client_id_is_rejected() {
        let config = StorageConfig::new().with_client_id(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn tiny_block_size_is_rejected() {
        let config = StorageConfig::new().with_block_size_bytes(64);
        assert!(config.validate().is_err());
    }

    #[test]
    fn capacity_subtracts_all_overhead() {
        let config = StorageConfig::default();
        assert_eq!(
            config.plaintext_block_capacity(),
            32 * 1024 - FORMAT_VERSION_HEADER_SIZE - SEALED_OVERHEAD
        );
    }
}
