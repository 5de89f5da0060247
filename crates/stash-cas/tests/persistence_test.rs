//! Snapshot round trips, crash reconciliation, and eviction across sessions.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use stash_cas::{ContentKey, Storage};
use stash_config::StoreConfig;

fn new_storage(root: &Path, capacity: u64, compressed: bool) -> Storage {
    let mut cfg = StoreConfig::default();
    cfg.root_dir = root.to_path_buf();
    cfg.capacity_bytes = capacity;
    cfg.store_compressed = compressed;
    let storage = Storage::new(cfg).unwrap();
    storage.load().unwrap();
    storage
}

fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn blob_path(root: &Path, key: ContentKey) -> PathBuf {
    let hex = key.to_hex();
    root.join("cas").join(&hex[..2]).join(hex)
}

#[test]
fn test_snapshot_round_trip() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("store");

    let mut keys = Vec::new();
    let total_bytes;
    {
        let storage = new_storage(&root, 0, true);
        for i in 0..10 {
            let src = write_file(
                temp.path(),
                &format!("file_{i}.bin"),
                format!("distinct content number {i}").as_bytes(),
            );
            keys.push(storage.store_file(&src, None, false, false).unwrap());
        }
        total_bytes = storage.stats().total_bytes;
        storage.close().unwrap();
    }

    let storage = new_storage(&root, 0, true);
    let stats = storage.stats();
    assert_eq!(stats.entry_count, 10);
    assert_eq!(stats.total_bytes, total_bytes);
    for key in &keys {
        assert!(storage.ensure_available(*key), "missing {key}");
    }
}

#[test]
fn test_snapshot_preserves_file_records() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("store");
    let src = write_file(temp.path(), "input.bin", b"recorded content");

    let key;
    {
        let storage = new_storage(&root, 0, true);
        key = storage.store_file(&src, None, false, false).unwrap();
        storage.close().unwrap();
    }

    // The reloaded record matches on (size, mtime): the second session must
    // return the same key without the file's mtime having been touched.
    let storage = new_storage(&root, 0, true);
    assert!(storage.stats().file_record_count > 0);
    assert_eq!(storage.resolve_key(&src, None, false).unwrap(), key);
}

#[test]
fn test_crash_reconciliation_matches_disk() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("store");

    let key_a;
    let key_b;
    {
        let storage = new_storage(&root, 0, true);
        let a = write_file(temp.path(), "a.bin", b"content that survives");
        let b = write_file(temp.path(), "b.bin", b"content that vanishes");
        key_a = storage.store_file(&a, None, false, false).unwrap();
        key_b = storage.store_file(&b, None, false, false).unwrap();
        storage.save().unwrap();
        // No close(): the .running marker stays, simulating a crash.
    }
    assert!(root.join(".running").exists());

    // Behind the stale snapshot's back, b's blob disappears.
    fs::remove_file(blob_path(&root, key_b)).unwrap();

    let storage = new_storage(&root, 0, true);
    // The rebuilt table matches the blobs actually on disk, not the stale
    // snapshot's claims.
    assert_eq!(storage.stats().entry_count, 1);
    assert!(storage.ensure_available(key_a));
    assert!(!storage.ensure_available(key_b));
}

#[test]
fn test_reconciliation_adopts_untracked_blobs() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("store");

    let key_a;
    let key_b;
    {
        let storage = new_storage(&root, 0, true);
        let a = write_file(temp.path(), "a.bin", b"tracked");
        key_a = storage.store_file(&a, None, false, false).unwrap();

        // b is stored, then the snapshot is rewound to before b existed by
        // saving first and storing after.
        storage.save().unwrap();
        let b = write_file(temp.path(), "b.bin", b"untracked");
        key_b = storage.store_file(&b, None, false, false).unwrap();
        // Crash: no close, no save.
    }

    let storage = new_storage(&root, 0, true);
    // The reconciliation scan found b's blob even though the stale
    // snapshot never heard of it.
    assert!(storage.ensure_available(key_b));
    assert!(storage.ensure_available(key_a));
    assert_eq!(storage.stats().entry_count, 2);
}

#[test]
fn test_reconciliation_deletes_corrupt_blobs() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("store");

    {
        let storage = new_storage(&root, 0, true);
        let a = write_file(temp.path(), "a.bin", b"good content");
        storage.store_file(&a, None, false, false).unwrap();
        // Crash without close.
    }

    // Plant a garbage blob under a plausible compressed key name.
    let fake_key = stash_codec::compute_key(b"planted", true);
    let fake_blob = blob_path(&root, fake_key);
    fs::create_dir_all(fake_blob.parent().unwrap()).unwrap();
    fs::write(&fake_blob, vec![0xABu8; 64]).unwrap();

    let storage = new_storage(&root, 0, true);
    assert!(!fake_blob.exists(), "corrupt blob should be deleted");
    assert!(!storage.has_content(fake_key));
    assert_eq!(storage.stats().entry_count, 1);
}

#[test]
fn test_version_mismatch_purges_store() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("store");

    {
        let storage = new_storage(&root, 0, true);
        let a = write_file(temp.path(), "a.bin", b"old generation");
        storage.store_file(&a, None, false, false).unwrap();
        storage.close().unwrap();
    }

    // Rewrite the snapshot header with a bogus format version.
    let snapshot = root.join("casdb");
    let mut data = fs::read(&snapshot).unwrap();
    data[0..4].copy_from_slice(&9999u32.to_le_bytes());
    fs::write(&snapshot, &data).unwrap();

    let storage = new_storage(&root, 0, true);
    let stats = storage.stats();
    assert_eq!(stats.entry_count, 0);
    assert_eq!(stats.total_bytes, 0);
    // All blobs were purged rather than partially interpreted.
    assert_eq!(
        walkdir::WalkDir::new(root.join("cas"))
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count(),
        0
    );
}

#[test]
fn test_truncated_snapshot_recovers_from_disk() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("store");

    let key;
    {
        let storage = new_storage(&root, 0, true);
        let a = write_file(temp.path(), "a.bin", b"survives truncation");
        key = storage.store_file(&a, None, false, false).unwrap();
        storage.close().unwrap();
    }

    // Chop the snapshot mid-entry: the index is rebuilt from the blobs.
    let snapshot = root.join("casdb");
    let data = fs::read(&snapshot).unwrap();
    fs::write(&snapshot, &data[..data.len() - 20]).unwrap();

    let storage = new_storage(&root, 0, true);
    assert!(storage.ensure_available(key));
    assert_eq!(storage.stats().entry_count, 1);
}

#[test]
fn test_manual_eviction_after_load_respects_budget() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("store");

    let mut keys = Vec::new();
    {
        // Raw store so entry sizes are exact.
        let storage = new_storage(&root, 0, false);
        for i in 0..4 {
            let src = write_file(temp.path(), &format!("f{i}.bin"), &vec![i as u8; 1000]);
            keys.push(storage.store_file(&src, None, false, false).unwrap());
        }
        storage.close().unwrap();
    }

    // Reload with a 2500-byte budget: the two least recently used entries
    // go, the two newest stay.
    let storage = new_storage(&root, 2500, false);
    assert!(storage.stats().total_bytes <= 2500);
    assert!(!storage.ensure_available(keys[0]));
    assert!(!storage.ensure_available(keys[1]));
    assert!(storage.ensure_available(keys[2]));
    assert!(storage.ensure_available(keys[3]));
}

#[test]
fn test_incremental_eviction_spares_in_use_entries() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("store");

    let mut old_keys = Vec::new();
    {
        let storage = new_storage(&root, 0, false);
        for i in 0..4 {
            let src = write_file(temp.path(), &format!("f{i}.bin"), &vec![i as u8; 1000]);
            old_keys.push(storage.store_file(&src, None, false, false).unwrap());
        }
        storage.close().unwrap();
    }

    // 4000 bytes loaded under a 4500-byte budget. Verify every old entry
    // (marking each in use this session), then push the total over budget
    // with a new store: the walk stops at the first verified entry, so
    // nothing is evicted and the overflow is logged and allowed.
    let storage = new_storage(&root, 4500, false);
    for key in &old_keys {
        assert!(storage.ensure_available(*key));
    }

    let src = write_file(temp.path(), "new.bin", &vec![9u8; 1000]);
    let new_key = storage.store_file(&src, None, false, false).unwrap();

    let stats = storage.stats();
    assert_eq!(stats.total_bytes, 5000);
    assert_eq!(stats.evicted_count, 0);
    for key in &old_keys {
        assert!(storage.ensure_available(*key));
    }
    assert!(storage.ensure_available(new_key));
}

#[test]
fn test_incremental_eviction_trims_idle_entries() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("store");

    let mut old_keys = Vec::new();
    {
        let storage = new_storage(&root, 0, false);
        for i in 0..4 {
            let src = write_file(temp.path(), &format!("f{i}.bin"), &vec![i as u8; 1000]);
            old_keys.push(storage.store_file(&src, None, false, false).unwrap());
        }
        storage.close().unwrap();
    }

    // 4000 bytes loaded under a 4500-byte budget; storing 1000 more walks
    // the cold end and evicts the single oldest idle entry to get back
    // under budget.
    let storage = new_storage(&root, 4500, false);
    let src = write_file(temp.path(), "new.bin", &vec![9u8; 1000]);
    let new_key = storage.store_file(&src, None, false, false).unwrap();

    let stats = storage.stats();
    assert_eq!(stats.total_bytes, 4000);
    assert_eq!(stats.evicted_count, 1);
    assert!(!storage.ensure_available(old_keys[0]));
    assert!(storage.ensure_available(old_keys[1]));
    assert!(storage.ensure_available(new_key));
}
