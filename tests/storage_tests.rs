// Integration tests for session storage handles
//
// These tests verify the persistent/transient split: transient backing files
// never outlive their handle, persistent ones do, and an unavailable durable
// directory downgrades the handle to a scratch-backed transient file.

use std::fs;

use tempfile::TempDir;
use voice_capture::{StorageConfig, StorageHandle, StorageKind};

fn storage_config(temp_dir: &TempDir) -> StorageConfig {
    StorageConfig {
        recordings_dir: temp_dir.path().join("recordings"),
        scratch_dir: Some(temp_dir.path().join("scratch")),
    }
}

fn write_silence(handle: &mut StorageHandle) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = handle.open_writer(spec).expect("writer opens");
    for _ in 0..800 {
        writer.write_sample(0i16).expect("sample writes");
    }
    writer.finalize().expect("writer finalizes");
}

#[test]
fn transient_file_is_removed_on_drop() {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = storage_config(&temp_dir);

    let mut handle = StorageHandle::create(StorageKind::Transient, &config).expect("handle");
    write_silence(&mut handle);

    let path = handle.path().to_path_buf();
    assert!(path.exists());

    drop(handle);
    assert!(!path.exists(), "transient file must be removed on drop");
}

#[test]
fn persistent_file_survives_drop() {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = storage_config(&temp_dir);

    let mut handle = StorageHandle::create(StorageKind::Persistent, &config).expect("handle");
    write_silence(&mut handle);

    let path = handle.path().to_path_buf();
    drop(handle);
    assert!(path.exists(), "persistent file must survive its handle");
}

#[test]
fn delete_is_idempotent_and_tolerates_missing_files() {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = storage_config(&temp_dir);

    let mut handle = StorageHandle::create(StorageKind::Persistent, &config).expect("handle");

    // Deleting a file that was never created is fine.
    handle.delete().expect("delete without file");

    write_silence(&mut handle);
    handle.delete().expect("first delete");
    handle.delete().expect("second delete");
    assert!(!handle.exists());
}

#[test]
fn unavailable_recordings_dir_falls_back_to_scratch() {
    let temp_dir = TempDir::new().expect("temp dir");

    // Block the durable directory by putting a file where it should go.
    let blocker = temp_dir.path().join("blocker");
    fs::write(&blocker, b"not a directory").expect("blocker file");

    let config = StorageConfig {
        recordings_dir: blocker.join("recordings"),
        scratch_dir: Some(temp_dir.path().join("scratch")),
    };

    let handle = StorageHandle::create(StorageKind::Persistent, &config).expect("handle");

    // The handle degraded to a transient scratch file.
    assert_eq!(handle.kind(), StorageKind::Transient);
    assert!(handle.path().starts_with(temp_dir.path().join("scratch")));
}

#[test]
fn reader_sees_what_the_writer_stored() {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = storage_config(&temp_dir);

    let mut handle = StorageHandle::create(StorageKind::Persistent, &config).expect("handle");
    write_silence(&mut handle);

    let reader = handle.open_reader().expect("reader opens");
    assert_eq!(reader.spec().sample_rate, 8000);
    assert_eq!(reader.spec().channels, 1);
    assert_eq!(reader.duration(), 800);
}
