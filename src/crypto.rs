//! Sealing and unsealing of block bodies.
//!
//! Sealed block layout (the bytes handed to the base store):
//!
//! ```text
//! [ u64 LE version ][ u32 LE client_id ][ AES-256-GCM( BlockId ‖ body ) ][ 16 B tag ]
//! ```
//!
//! The leading 12 bytes double as the GCM nonce, so they are authenticated
//! by the tag even though they are stored in the clear: flipping either
//! the header or the ciphertext fails decryption. The block id is sealed
//! inside the ciphertext to bind id to body; a block file copied over
//! another id's path fails the embedded-id check after decryption.
//!
//! Nonce uniqueness relies on the version counter being strictly
//! increasing per client across the lifetime of the filesystem; the
//! integrity layer seeds the counter past every previously recorded
//! version on startup.
//!
//! # Security Properties
//!
//! - **Zeroize on drop**: `EncryptionKey` clears its key material when
//!   dropped and never prints it via `Debug`.
//! - **Authenticated headers**: version and client id cannot be tampered
//!   with independently of the ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::block_id::{BlockId, BLOCK_ID_SIZE};
use crate::error::{IntegrityViolationKind, StoreError};

/// Size of the symmetric key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the GCM nonce in bytes; equals the clear header size.
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Clear header in front of the ciphertext: version + client id.
pub const CLEAR_HEADER_SIZE: usize = 8 + 4;

/// Total sealing overhead: clear header, embedded block id, AEAD tag.
pub const SEALED_OVERHEAD: usize = CLEAR_HEADER_SIZE + BLOCK_ID_SIZE + TAG_SIZE;

/// Symmetric key for block sealing, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    #[must_use]
    pub const fn from_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Build a key from a slice; `None` unless it is exactly 32 bytes.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().ok()?;
        Some(Self { bytes })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The authenticated freshness header of a sealed block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Monotonic per-client version counter.
    pub version: u64,
    /// Identifier of the client that wrote this ciphertext.
    pub client_id: u32,
}

impl BlockHeader {
    fn nonce_bytes(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&self.version.to_le_bytes());
        nonce[8..].copy_from_slice(&self.client_id.to_le_bytes());
        nonce
    }

    fn from_nonce_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < NONCE_SIZE {
            return None;
        }
        let version = u64::from_le_bytes(bytes[..8].try_into().ok()?);
        let client_id = u32::from_le_bytes(bytes[8..NONCE_SIZE].try_into().ok()?);
        Some(Self { version, client_id })
    }
}

/// A successfully unsealed block: its freshness header and plaintext body.
pub struct UnsealedBlock {
    pub header: BlockHeader,
    pub body: Vec<u8>,
}

impl std::fmt::Debug for UnsealedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnsealedBlock")
            .field("header", &self.header)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Seal a plaintext body under `key` for the given id and header.
pub fn seal(
    key: &EncryptionKey,
    id: &BlockId,
    header: BlockHeader,
    body: &[u8],
) -> Result<Vec<u8>, StoreError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce_bytes = header.nonce_bytes();

    let mut plaintext = Vec::with_capacity(BLOCK_ID_SIZE + body.len());
    plaintext.extend_from_slice(id.as_bytes());
    plaintext.extend_from_slice(body);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
        .map_err(|_| StoreError::InvariantViolation("block encryption failed".to_string()))?;
    plaintext.zeroize();

    let mut sealed = Vec::with_capacity(CLEAR_HEADER_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Unseal a block loaded for `expected_id`.
///
/// Fails with `IntegrityViolation(AeadMismatch)` when authentication fails
/// and with `IntegrityViolation(Swap)` when the embedded id differs from
/// the requested one.
pub fn unseal(
    key: &EncryptionKey,
    expected_id: &BlockId,
    sealed: &[u8],
) -> Result<UnsealedBlock, StoreError> {
    if sealed.len() < SEALED_OVERHEAD {
        return Err(StoreError::integrity(
            *expected_id,
            IntegrityViolationKind::AeadMismatch,
        ));
    }
    let header = BlockHeader::from_nonce_bytes(sealed).ok_or_else(|| {
        StoreError::integrity(*expected_id, IntegrityViolationKind::AeadMismatch)
    })?;
    let nonce_bytes = header.nonce_bytes();

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            &sealed[CLEAR_HEADER_SIZE..],
        )
        .map_err(|_| StoreError::integrity(*expected_id, IntegrityViolationKind::AeadMismatch))?;

    let embedded_id = BlockId::from_slice(&plaintext[..BLOCK_ID_SIZE]).ok_or_else(|| {
        StoreError::integrity(*expected_id, IntegrityViolationKind::AeadMismatch)
    })?;
    if embedded_id != *expected_id {
        return Err(StoreError::integrity(
            *expected_id,
            IntegrityViolationKind::Swap,
        ));
    }

    Ok(UnsealedBlock {
        header,
        body: plaintext[BLOCK_ID_SIZE..].to_vec(),
    })
}
