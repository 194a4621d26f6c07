//! Error taxonomy shared across the store layers.
//!
//! Absence is not an error: `load` returns `Ok(None)` for a missing block
//! and `try_create` returns `Ok(false)` for an occupied id. Everything that
//! does surface as an error is either adversarial (`IntegrityViolation`),
//! environmental (`Io`, `OutOfSpace`), a caller mistake (`OutOfRange`), or
//! an internal bug (`InvariantViolation`).

use std::fmt;
use std::io;

use crate::block_id::BlockId;

/// Classification of a detected integrity violation.
///
/// All of these are potentially adversarial and must be surfaced to the
/// user; no layer converts them into "not found".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityViolationKind {
    /// AEAD authentication failed; the ciphertext was modified.
    AeadMismatch,
    /// The id embedded in the ciphertext does not match the requested id;
    /// a block file was moved or copied over another.
    Swap,
    /// The observed version counter is older than the last one seen from
    /// the same client; an earlier ciphertext was restored.
    Rollback,
    /// The file carries a block format header from a newer format version.
    UnsupportedFormat,
    /// The file carries no recognizable block format header at all.
    NotABlock,
    /// A block known to exist has disappeared from the backend while the
    /// missing-block policy treats that as an attack.
    MissingBlock,
}

impl fmt::Display for IntegrityViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AeadMismatch => "aead mismatch",
            Self::Swap => "block id swap",
            Self::Rollback => "rollback to an older version",
            Self::UnsupportedFormat => "unsupported block format",
            Self::NotABlock => "not a block",
            Self::MissingBlock => "known block is missing",
        };
        f.write_str(name)
    }
}

/// Errors produced by the block and blob store layers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The stored data failed an authenticity or freshness check.
    #[error("integrity violation on block {block}: {kind}")]
    IntegrityViolation {
        block: BlockId,
        kind: IntegrityViolationKind,
    },

    /// The integrity state file exists but cannot be used.
    #[error("integrity state file is unreadable: {0}")]
    BadIntegrityState(String),

    /// The backend has no free space left.
    #[error("backend out of space")]
    OutOfSpace,

    /// Any other backend I/O failure.
    #[error("io error: {context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A blob access outside the blob's current size.
    #[error("range [{offset}, {offset}+{len}) is outside blob of size {size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    /// An internal invariant does not hold. This indicates a bug, not an
    /// attack; callers should flush what they can and abort the mount.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl StoreError {
    /// Wrap an I/O error with a short description of the failed operation.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::StorageFull {
            return Self::OutOfSpace;
        }
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn integrity(block: BlockId, kind: IntegrityViolationKind) -> Self {
        Self::IntegrityViolation { block, kind }
    }

    #[must_use]
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            Self::IntegrityViolation { .. } | Self::BadIntegrityState(_)
        )
    }
}
