//! Adversarial tests against the on-disk state.
//!
//! Each scenario tampers with the backing directory the way an attacker
//! with control over the storage would: flipping ciphertext bits,
//! swapping block files, restoring old file contents, forging headers.
//! Every manipulation must surface as an `IntegrityViolation`; none may
//! be silently converted into "not found".

use std::fs;
use std::path::{Path, PathBuf};

use veilfs_storage::{
    open_disk_stack, BlockId, EncryptionKey, IntegrityViolationKind, StorageConfig, StoreError,
    KEY_SIZE,
};

fn key() -> EncryptionKey {
    EncryptionKey::from_array([0x55; KEY_SIZE])
}

fn block_path(root: &Path, id: &BlockId) -> PathBuf {
    let hex = id.to_hex();
    root.join(&hex[..3]).join(&hex[3..])
}

/// Create a block with the given body and return its id, with everything
/// flushed to disk and the writing stack closed.
fn write_block_and_close(root: &Path, config: &StorageConfig, body: &[u8]) -> BlockId {
    let stack = open_disk_stack(root, key(), config).unwrap();
    let handle = stack.create(body.to_vec()).unwrap();
    let id = handle.id();
    drop(handle);
    stack.flush().unwrap();
    id
}

fn expect_violation(result: Result<Option<Vec<u8>>, StoreError>, expected: IntegrityViolationKind) {
    match result {
        Err(StoreError::IntegrityViolation { kind, .. }) => assert_eq!(kind, expected),
        other => panic!("expected IntegrityViolation({expected:?}), got {other:?}"),
    }
}

/// Loading a handle's bytes through a fresh stack.
fn load_body(root: &Path, config: &StorageConfig, id: &BlockId) -> Result<Option<Vec<u8>>, StoreError> {
    let stack = open_disk_stack(root, key(), config)?;
    match stack.load(id) {
        Ok(Some(handle)) => {
            let body = handle.read().data().to_vec();
            Ok(Some(body))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(e),
    }
}

#[test]
fn restoring_an_old_ciphertext_is_a_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default();
    let id = write_block_and_close(dir.path(), &config, b"payload A");
    let path = block_path(dir.path(), &id);
    let old_file = fs::read(&path).unwrap();

    // Overwrite with payload B through a fresh stack.
    {
        let stack = open_disk_stack(dir.path(), key(), &config).unwrap();
        let handle = stack.load(&id).unwrap().unwrap();
        handle.write().set_body(b"payload B".to_vec());
        drop(handle);
        stack.flush().unwrap();
    }

    // Restore the old file: rollback.
    fs::write(&path, old_file).unwrap();
    expect_violation(
        load_body(dir.path(), &config, &id),
        IntegrityViolationKind::Rollback,
    );
}

#[test]
fn swapping_two_block_files_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default();
    let id_x = write_block_and_close(dir.path(), &config, b"block X");
    let id_y = write_block_and_close(dir.path(), &config, b"block Y");

    // Put Y's file at X's path.
    let y_file = fs::read(block_path(dir.path(), &id_y)).unwrap();
    fs::write(block_path(dir.path(), &id_x), y_file).unwrap();

    expect_violation(
        load_body(dir.path(), &config, &id_x),
        IntegrityViolationKind::Swap,
    );
}

#[test]
fn flipping_a_ciphertext_bit_fails_authentication() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default();
    let id = write_block_and_close(dir.path(), &config, b"bit flip target");
    let path = block_path(dir.path(), &id);

    let mut file = fs::read(&path).unwrap();
    let last = file.len() - 1;
    file[last] ^= 0x01;
    fs::write(&path, file).unwrap();

    expect_violation(
        load_body(dir.path(), &config, &id),
        IntegrityViolationKind::AeadMismatch,
    );
}

#[test]
fn forged_newer_format_header_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default();
    let id = write_block_and_close(dir.path(), &config, b"format target");
    let path = block_path(dir.path(), &id);

    let mut file = fs::read(&path).unwrap();
    file[12] = b'7'; // a format version this build does not know
    fs::write(&path, file).unwrap();

    expect_violation(
        load_body(dir.path(), &config, &id),
        IntegrityViolationKind::UnsupportedFormat,
    );
}

#[test]
fn foreign_file_at_a_block_path_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default();
    let id = write_block_and_close(dir.path(), &config, b"replace target");

    fs::write(block_path(dir.path(), &id), b"no block header here").unwrap();
    expect_violation(
        load_body(dir.path(), &config, &id),
        IntegrityViolationKind::NotABlock,
    );
}

#[test]
fn wrong_key_cannot_read_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default();
    let id = write_block_and_close(dir.path(), &config, b"keyed");

    let stack = open_disk_stack(
        dir.path(),
        EncryptionKey::from_array([0x56; KEY_SIZE]),
        &config,
    )
    .unwrap();
    match stack.load(&id) {
        Err(StoreError::IntegrityViolation { kind, .. }) => {
            assert_eq!(kind, IntegrityViolationKind::AeadMismatch);
        }
        other => panic!("expected AeadMismatch, got {other:?}"),
    }
}

#[test]
fn deleting_a_known_block_is_flagged_under_the_strict_policy() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default().with_missing_block_is_integrity_violation(true);
    let id = write_block_and_close(dir.path(), &config, b"disappearing");

    fs::remove_file(block_path(dir.path(), &id)).unwrap();
    expect_violation(
        load_body(dir.path(), &config, &id),
        IntegrityViolationKind::MissingBlock,
    );
}

#[test]
fn deleting_a_known_block_is_absence_under_the_default_policy() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default();
    let id = write_block_and_close(dir.path(), &config, b"disappearing");

    fs::remove_file(block_path(dir.path(), &id)).unwrap();
    assert!(load_body(dir.path(), &config, &id).unwrap().is_none());
}

#[test]
fn corrupt_integrity_state_rejects_startup() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default();
    write_block_and_close(dir.path(), &config, b"whatever");

    fs::write(
        dir.path().join(veilfs_storage::STATE_FILE_NAME),
        b"scrambled",
    )
    .unwrap();
    assert!(matches!(
        open_disk_stack(dir.path(), key(), &config),
        Err(StoreError::BadIntegrityState(_))
    ));
}

#[test]
fn integrity_state_survives_reopen_and_keeps_versions_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default();
    let id = write_block_and_close(dir.path(), &config, b"versioned");

    // Rewrite the block in a second session.
    {
        let stack = open_disk_stack(dir.path(), key(), &config).unwrap();
        let handle = stack.load(&id).unwrap().unwrap();
        handle.write().set_body(b"versioned v2".to_vec());
        drop(handle);
        stack.flush().unwrap();
    }

    // The clear version prefix sits right behind the format header; the
    // second write must carry a strictly larger version even though it
    // happened in a fresh process lifecycle.
    let file = fs::read(block_path(dir.path(), &id)).unwrap();
    let version = u64::from_le_bytes(
        file[veilfs_storage::FORMAT_VERSION_HEADER_SIZE..veilfs_storage::FORMAT_VERSION_HEADER_SIZE + 8]
            .try_into()
            .unwrap(),
    );
    assert!(version >= 2);

    // And a third session still accepts the block.
    assert_eq!(
        load_body(dir.path(), &config, &id).unwrap().unwrap(),
        b"versioned v2"
    );
}
