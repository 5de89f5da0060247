//! The file-verification cache: path -> (size, mtime, content key).
//!
//! Pure cache. Losing it only costs a re-hash, never correctness, so it is
//! safe to discard and rebuild at any time. Records carry their own mutex,
//! held across the hashing I/O they guard; the map itself is a concurrent
//! `DashMap` touched only for lookups and inserts.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;

use stash_codec::ContentKey;

/// Hash of a file path, used as the cache key and in snapshots.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct PathKey(pub [u8; 32]);

impl PathKey {
    pub fn of(path: &Path) -> PathKey {
        PathKey(blake3::hash(path.as_os_str().as_encoded_bytes()).into())
    }
}

#[derive(Default)]
pub(crate) struct RecordState {
    pub size: u64,
    /// Nanoseconds since the epoch.
    pub last_modified: u64,
    /// `None` until resolved (or after invalidation). `Some(ZERO)` records
    /// a confirmed-missing file.
    pub key: Option<ContentKey>,
    pub verified: bool,
}

pub(crate) struct FileRecord {
    pub state: std::sync::Mutex<RecordState>,
}

#[derive(Default)]
pub(crate) struct FileTable {
    records: DashMap<PathKey, Arc<FileRecord>>,
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: PathKey) -> Option<Arc<FileRecord>> {
        self.records.get(&key).map(|r| r.value().clone())
    }

    pub fn get_or_create(&self, key: PathKey) -> Arc<FileRecord> {
        self.records
            .entry(key)
            .or_insert_with(|| {
                Arc::new(FileRecord {
                    state: std::sync::Mutex::new(RecordState::default()),
                })
            })
            .value()
            .clone()
    }

    /// An external verifier already knows the file is unchanged: mark the
    /// record verified without any I/O, but only if its metadata matches.
    /// Being wrong here costs a future re-hash, nothing more.
    pub fn report_weak(&self, key: PathKey, size: u64, last_modified: u64) {
        let Some(record) = self.get(key) else { return };
        let mut st = record.state.lock().unwrap();
        if st.verified {
            return;
        }
        st.verified =
            st.size == size && st.last_modified == last_modified && st.key.is_some();
    }

    /// Forget what we knew about a path; the next resolve re-hashes.
    pub fn invalidate(&self, key: PathKey) -> bool {
        let Some(record) = self.get(key) else {
            return false;
        };
        let mut st = record.state.lock().unwrap();
        st.verified = false;
        st.key = None;
        true
    }

    /// Snapshot every record that has a usable key.
    pub fn collect(&self) -> Vec<(PathKey, u64, u64, ContentKey)> {
        self.records
            .iter()
            .filter_map(|item| {
                let st = item.value().state.lock().unwrap();
                match st.key {
                    Some(key) if !key.is_zero() => {
                        Some((*item.key(), st.size, st.last_modified, key))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    /// Insert a record read back from a snapshot (unverified until checked
    /// against the live file).
    pub fn insert_loaded(&self, key: PathKey, size: u64, last_modified: u64, content: ContentKey) {
        let record = self.get_or_create(key);
        let mut st = record.state.lock().unwrap();
        st.size = size;
        st.last_modified = last_modified;
        st.key = Some(content);
        st.verified = false;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn clear(&self) {
        self.records.clear();
    }
}

/// File mtime as nanoseconds since the epoch.
pub(crate) fn mtime_nanos(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stash_codec::compute_key;

    #[test]
    fn test_report_weak_requires_matching_metadata() {
        let table = FileTable::new();
        let pk = PathKey::of(Path::new("/tmp/a"));
        let record = table.get_or_create(pk);
        {
            let mut st = record.state.lock().unwrap();
            st.size = 10;
            st.last_modified = 42;
            st.key = Some(compute_key(b"a", true));
        }
        table.report_weak(pk, 10, 41);
        assert!(!record.state.lock().unwrap().verified);
        table.report_weak(pk, 10, 42);
        assert!(record.state.lock().unwrap().verified);
    }

    #[test]
    fn test_invalidate_clears_key() {
        let table = FileTable::new();
        let pk = PathKey::of(Path::new("/tmp/b"));
        let record = table.get_or_create(pk);
        {
            let mut st = record.state.lock().unwrap();
            st.key = Some(compute_key(b"b", true));
            st.verified = true;
        }
        assert!(table.invalidate(pk));
        let st = record.state.lock().unwrap();
        assert!(!st.verified);
        assert!(st.key.is_none());
        assert!(!table.invalidate(PathKey::of(Path::new("/tmp/missing"))));
    }

    #[test]
    fn test_collect_skips_unknown_and_missing() {
        let table = FileTable::new();
        let known = PathKey::of(Path::new("/k"));
        let missing = PathKey::of(Path::new("/m"));
        let unresolved = PathKey::of(Path::new("/u"));
        table
            .get_or_create(known)
            .state
            .lock()
            .unwrap()
            .key = Some(compute_key(b"k", false));
        table.get_or_create(missing).state.lock().unwrap().key = Some(ContentKey::ZERO);
        table.get_or_create(unresolved);
        let collected = table.collect();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].0, known);
    }
}
