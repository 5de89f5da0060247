//! The storage orchestrator.
//!
//! [`Storage`] owns the entry table, the file-verification cache, the
//! deferred-creation ledger and the blob directory, and drives compression,
//! eviction and persistence. One instance per store root; all collaborators
//! receive it by reference.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use stash_codec::{
    compute_key_for_file, empty_key, BlockCodec, BlockEncoder, BufferPool, ContentKey,
    DeflateCodec, BUFFER_SLOT_SIZE,
};
use stash_config::StoreConfig;

use crate::entry::{EntryId, EntryState, EntryTable, EvictionCandidate};
use crate::file_table::{mtime_nanos, FileTable, PathKey};
use crate::materialize::MaterializeGate;
use crate::{Result, StoreError};

/// A promised key whose physical write is postponed until someone needs
/// definitive existence information.
pub(crate) struct DeferredCreation {
    pub source_path: PathBuf,
    pub source_is_compressed: bool,
}

#[derive(Default)]
pub(crate) struct DeferredCreations {
    pub by_key: HashMap<ContentKey, DeferredCreation>,
    pub by_path: HashMap<PathKey, ContentKey>,
}

/// Point-in-time counters for reporting.
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub entry_count: usize,
    pub file_record_count: usize,
    pub deferred_count: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub evicted_count: u64,
    pub evicted_bytes: u64,
    pub dropped_count: u64,
    pub dropped_bytes: u64,
}

/// The content-addressable store service.
pub struct Storage {
    pub(crate) cfg: StoreConfig,
    pub(crate) codec: Box<dyn BlockCodec>,
    pub(crate) pool: BufferPool,
    pub(crate) entries: EntryTable,
    pub(crate) files: FileTable,
    pub(crate) deferred: Mutex<DeferredCreations>,
    pub(crate) gate: MaterializeGate,
    /// Set by `load`, checked by `save`. Guards the whole load/save cycle.
    pub(crate) loaded: Mutex<bool>,
    pub(crate) workers: usize,
}

impl Storage {
    /// Create a storage service over `cfg.root_dir` with the default codec.
    /// Call [`Storage::load`] before using it.
    pub fn new(cfg: StoreConfig) -> Result<Storage> {
        Self::with_codec(cfg, Box::new(DeflateCodec))
    }

    /// Create a storage service with a specific block codec.
    pub fn with_codec(cfg: StoreConfig, codec: Box<dyn BlockCodec>) -> Result<Storage> {
        let workers = if cfg.worker_threads == 0 {
            num_cpus::get()
        } else {
            cfg.worker_threads
        };
        let storage = Storage {
            cfg,
            codec,
            pool: BufferPool::new(),
            entries: EntryTable::new(),
            files: FileTable::new(),
            deferred: Mutex::new(DeferredCreations::default()),
            gate: MaterializeGate::new(),
            loaded: Mutex::new(false),
            workers,
        };
        fs::create_dir_all(storage.cas_dir())?;
        fs::create_dir_all(storage.temp_dir())?;
        storage.clear_temp_dir();
        Ok(storage)
    }

    pub fn root(&self) -> &Path {
        &self.cfg.root_dir
    }

    pub(crate) fn cas_dir(&self) -> PathBuf {
        self.cfg.root_dir.join("cas")
    }

    pub(crate) fn temp_dir(&self) -> PathBuf {
        self.cfg.root_dir.join("castemp")
    }

    pub(crate) fn snapshot_path(&self) -> PathBuf {
        self.cfg.root_dir.join("casdb")
    }

    pub(crate) fn marker_path(&self) -> PathBuf {
        self.cfg.root_dir.join(".running")
    }

    /// Blob location: one file per key, sharded by the first byte of the
    /// key's hex form to bound directory fan-out.
    pub(crate) fn blob_path(&self, key: ContentKey) -> PathBuf {
        let hex = key.to_hex();
        self.cas_dir().join(&hex[..2]).join(hex)
    }

    fn temp_path(&self, key: ContentKey) -> PathBuf {
        self.temp_dir().join(format!(
            "{}.{}.{:?}.tmp",
            &key.to_hex()[..16],
            std::process::id(),
            std::thread::current().id()
        ))
    }

    fn clear_temp_dir(&self) {
        if let Ok(dir) = fs::read_dir(self.temp_dir()) {
            for entry in dir.flatten() {
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    fn is_disallowed_path(&self, path: &Path) -> bool {
        self.cfg
            .disallowed_paths
            .iter()
            .any(|prefix| path.starts_with(prefix))
    }

    // ------------------------------------------------------------------
    // Key resolution (file-verification cache)
    // ------------------------------------------------------------------

    /// Resolve the content key for a file, skipping the re-hash when the
    /// cached `(size, mtime)` still matches a verified record.
    ///
    /// A missing file resolves to [`ContentKey::ZERO`]. An
    /// `override_key`, when supplied, is trusted without hashing. The fresh
    /// `(size, mtime, key)` is always written back before returning.
    pub fn resolve_key(
        &self,
        path: &Path,
        override_key: Option<ContentKey>,
        source_is_compressed: bool,
    ) -> Result<ContentKey> {
        let record = self.files.get_or_create(PathKey::of(path));
        let mut st = record.state.lock().unwrap();

        if st.verified {
            return Ok(st.key.unwrap_or(ContentKey::ZERO));
        }
        st.verified = true;

        let meta = match fs::metadata(path) {
            Ok(m) => m,
            Err(_) => {
                st.key = Some(ContentKey::ZERO);
                return Ok(ContentKey::ZERO);
            }
        };
        let size = meta.len();
        let mtime = mtime_nanos(&meta);

        let matches_cached = st.key.is_some_and(|k| !k.is_zero())
            && st.size == size
            && st.last_modified == mtime;
        st.size = size;
        st.last_modified = mtime;

        if let Some(key) = override_key {
            let key = key.as_compressed(self.cfg.store_compressed);
            st.key = Some(key);
            return Ok(key);
        }
        if matches_cached {
            return Ok(st.key.unwrap());
        }
        if source_is_compressed {
            st.verified = false;
            st.key = None;
            return Err(StoreError::Unsupported(
                "a pre-compressed source needs an explicit content key",
            ));
        }

        // Record lock held across the hash: concurrent resolvers of the
        // same path serialize here instead of hashing twice.
        match compute_key_for_file(&self.pool, path, self.cfg.store_compressed) {
            Ok(key) => {
                st.key = Some(key);
                Ok(key)
            }
            Err(e) => {
                st.verified = false;
                st.key = None;
                warn!(path = %path.display(), error = %e, "failed to hash file");
                Err(e.into())
            }
        }
    }

    /// Mark a path's record verified on an external verifier's word,
    /// without I/O. Harmless if wrong.
    pub fn report_file_weak(&self, path: &Path, size: u64, last_modified: u64) {
        self.files
            .report_weak(PathKey::of(path), size, last_modified);
    }

    /// Forget the cached verification for a path.
    pub fn invalidate_file(&self, path: &Path) -> bool {
        self.files.invalidate(PathKey::of(path))
    }

    // ------------------------------------------------------------------
    // Store / availability
    // ------------------------------------------------------------------

    /// Store a file's content, returning its key.
    ///
    /// With `defer` the physical write is postponed until the key's
    /// existence is first needed. Returns [`ContentKey::ZERO`] when the
    /// source file does not exist.
    pub fn store_file(
        &self,
        path: &Path,
        override_key: Option<ContentKey>,
        defer: bool,
        source_is_compressed: bool,
    ) -> Result<ContentKey> {
        let key = self.resolve_key(path, override_key, source_is_compressed)?;
        if key.is_zero() {
            return Ok(key);
        }
        self.add_entry(path, key, defer, source_is_compressed)?;
        Ok(key)
    }

    fn add_entry(
        &self,
        path: &Path,
        key: ContentKey,
        defer: bool,
        source_is_compressed: bool,
    ) -> Result<()> {
        debug_assert_eq!(key.is_compressed(), self.cfg.store_compressed);
        let (id, entry) = self.entries.find_or_insert(key);
        self.entries.touch(id);

        let mut st = entry.state.write().unwrap();
        if st.verified && st.exists {
            // The loser of a concurrent store for the same key lands here:
            // at most one physical write per key.
            return Ok(());
        }
        st.disallowed = self.is_disallowed_path(path);

        if !st.verified {
            if let Some((old, new)) = self.verify_existing(key, &mut st)? {
                drop(st);
                self.finish_write(id, old, new);
                return Ok(());
            }
        }

        if defer {
            let mut deferred = self.deferred.lock().unwrap();
            if !deferred.by_key.contains_key(&key) {
                deferred.by_key.insert(
                    key,
                    DeferredCreation {
                        source_path: path.to_path_buf(),
                        source_is_compressed,
                    },
                );
                deferred.by_path.insert(PathKey::of(path), key);
            }
            return Ok(());
        }

        st.verified = true;
        st.exists = false;
        let size = self.write_blob(path, source_is_compressed, key)?;
        st.exists = true;
        let old = st.size;
        st.size = size;
        drop(st);
        self.finish_write(id, old, size);
        Ok(())
    }

    /// Check the blob directory for an unverified entry. A zero-length blob
    /// whose key is not the empty-content key was never written fully and
    /// is deleted as corrupt.
    fn verify_existing(
        &self,
        key: ContentKey,
        st: &mut EntryState,
    ) -> Result<Option<(u64, u64)>> {
        let blob = self.blob_path(key);
        let meta = match fs::metadata(&blob) {
            Ok(m) => m,
            Err(_) => return Ok(None),
        };
        if meta.len() == 0 && key != empty_key(key.is_compressed()) {
            info!(blob = %blob.display(), "found zero-length blob that is not the empty key, deleting");
            if let Err(e) = fs::remove_file(&blob) {
                error!(blob = %blob.display(), error = %e, "failed to delete truncated blob");
                return Err(e.into());
            }
            return Ok(None);
        }
        st.verified = true;
        st.exists = true;
        let old = st.size;
        st.size = meta.len();
        Ok(Some((old, meta.len())))
    }

    /// Write the physical blob for `key` from `source`. Caller holds the
    /// entry's write lock, which serializes concurrent writers of one key.
    fn write_blob(&self, source: &Path, source_is_compressed: bool, key: ContentKey) -> Result<u64> {
        let dest = self.blob_path(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if key.is_compressed() && !source_is_compressed {
            self.write_compressed(source, key, &dest)
        } else if !key.is_compressed() && source_is_compressed {
            Err(StoreError::Unsupported(
                "storing a pre-compressed source into an uncompressed store is not supported",
            ))
        } else {
            self.write_raw_copy(source, key, &dest)
        }
    }

    fn write_compressed(&self, source: &Path, key: ContentKey, dest: &Path) -> Result<u64> {
        let mut file = File::open(source)?;
        let len = file.metadata()?.len();

        let tmp = self.temp_path(key);
        let mut out = BufWriter::new(File::create(&tmp)?);
        let mut encoder = BlockEncoder::new(&*self.codec, self.cfg.compression_level);
        encoder.workers = self.workers;

        let result = (|| -> Result<u64> {
            let written = if len as usize > BUFFER_SLOT_SIZE {
                let mmap = unsafe { memmap2::Mmap::map(&file)? };
                encoder.encode(&mmap, &mut out)?
            } else {
                let mut slot = self.pool.acquire();
                file.read_exact(&mut slot[..len as usize])?;
                encoder.encode(&slot[..len as usize], &mut out)?
            };
            let blob_file = out.into_inner().map_err(|e| e.into_error())?;
            blob_file.sync_all()?;
            Ok(written)
        })();

        match result {
            Ok(written) => {
                fs::rename(&tmp, dest)?;
                debug!(key = %key, raw = len, compressed = written, "wrote compressed blob");
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    fn write_raw_copy(&self, source: &Path, key: ContentKey, dest: &Path) -> Result<u64> {
        let mut file = File::open(source)?;
        let len = file.metadata()?.len();

        let tmp = self.temp_path(key);
        let result = (|| -> Result<()> {
            let mut out = BufWriter::new(File::create(&tmp)?);
            let mut slot = self.pool.acquire();
            let mut left = len;
            while left > 0 {
                let to_read = left.min(slot.len() as u64) as usize;
                file.read_exact(&mut slot[..to_read])?;
                out.write_all(&slot[..to_read])?;
                left -= to_read as u64;
            }
            out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                fs::rename(&tmp, dest)?;
                Ok(len)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    /// Tally a completed write, then run the incremental eviction pass.
    pub(crate) fn finish_write(&self, id: EntryId, old_size: u64, new_size: u64) {
        let candidates =
            self.entries
                .record_write(id, old_size, new_size, self.cfg.capacity_bytes);
        if !candidates.is_empty() {
            self.finalize_eviction(candidates);
        }
    }

    /// Delete the blobs of collected eviction candidates. Deletion happens
    /// under the entry's lock; a candidate revived by a concurrent store
    /// (exists again) is left alone, a failed delete rolls the entry back.
    fn finalize_eviction(&self, candidates: Vec<EvictionCandidate>) {
        for candidate in candidates {
            let mut st = candidate.entry.state.write().unwrap();
            if st.exists {
                continue;
            }
            match fs::remove_file(self.blob_path(candidate.key)) {
                Ok(()) => {
                    st.verified = true; // confirmed absent from here on
                    debug!(key = %candidate.key, bytes = candidate.size, "evicted blob");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    st.verified = true;
                }
                Err(e) => {
                    error!(key = %candidate.key, error = %e, "failed to delete blob during eviction");
                    st.exists = true;
                    st.size = candidate.size;
                    drop(st);
                    self.entries
                        .restore_after_failed_evict(candidate.id, candidate.size);
                }
            }
        }
    }

    /// Is this key's content available? Converts a pending deferred
    /// creation into a real write the first time the answer matters.
    pub fn has_content(&self, key: ContentKey) -> bool {
        match self.has_content_inner(key) {
            Ok(present) => present,
            Err(e) => {
                warn!(key = %key, error = %e, "availability check failed");
                false
            }
        }
    }

    pub(crate) fn has_content_inner(&self, key: ContentKey) -> Result<bool> {
        let Some((id, entry)) = self.entries.find(key) else {
            return Ok(false);
        };
        self.entries.touch(id);

        let mut st = entry.state.write().unwrap();
        if st.verified && st.exists {
            return Ok(true);
        }
        let Some(deferred) = self.take_deferred(key) else {
            return Ok(false);
        };
        st.verified = true;
        let size = self.write_blob(&deferred.source_path, deferred.source_is_compressed, key)?;
        st.exists = true;
        let old = st.size;
        st.size = size;
        drop(st);
        self.finish_write(id, old, size);
        Ok(true)
    }

    /// Make sure `key`'s content is present: flush a pending deferred
    /// creation, or verify an unverified entry against the blob directory.
    pub fn ensure_available(&self, key: ContentKey) -> bool {
        match self.ensure_available_inner(key) {
            Ok(present) => present,
            Err(e) => {
                warn!(key = %key, error = %e, "ensure-available failed");
                false
            }
        }
    }

    fn ensure_available_inner(&self, key: ContentKey) -> Result<bool> {
        let (id, entry) = self.entries.find_or_insert(key);
        self.entries.touch(id);

        let mut st = entry.state.write().unwrap();
        if st.verified {
            return Ok(st.exists);
        }
        if let Some(deferred) = self.take_deferred(key) {
            st.verified = true;
            let size = self.write_blob(&deferred.source_path, deferred.source_is_compressed, key)?;
            st.exists = true;
            let old = st.size;
            st.size = size;
            drop(st);
            self.finish_write(id, old, size);
            return Ok(true);
        }
        match self.verify_existing(key, &mut st)? {
            Some((old, new)) => {
                drop(st);
                self.finish_write(id, old, new);
                Ok(true)
            }
            None => {
                st.verified = true;
                st.exists = false;
                Ok(false)
            }
        }
    }

    fn take_deferred(&self, key: ContentKey) -> Option<DeferredCreation> {
        let mut deferred = self.deferred.lock().unwrap();
        let dc = deferred.by_key.remove(&key)?;
        deferred.by_path.remove(&PathKey::of(&dc.source_path));
        Some(dc)
    }

    // ------------------------------------------------------------------
    // Drop / invalidation
    // ------------------------------------------------------------------

    /// Drop a key's content. With `physical` the blob is deleted now and
    /// the tally updated; otherwise the delete is deferred to the next
    /// snapshot save.
    pub fn drop_content(&self, key: ContentKey, physical: bool) -> Result<()> {
        let Some((id, entry)) = self.entries.find(key) else {
            if physical {
                match fs::remove_file(self.blob_path(key)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        error!(key = %key, error = %e, "failed to drop untracked blob");
                        return Err(e.into());
                    }
                }
            }
            return Ok(());
        };

        let mut st = entry.state.write().unwrap();
        if physical {
            let mut deleted = 0;
            match fs::remove_file(self.blob_path(key)) {
                Ok(()) => deleted = st.size,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    error!(key = %key, error = %e, "failed to drop blob");
                    return Err(e.into());
                }
            }
            st.verified = true;
            st.exists = false;
            st.size = 0;
            drop(st);
            self.entries.record_dropped(id, deleted);
        } else {
            st.dropped = true;
        }
        Ok(())
    }

    /// A source file is about to be overwritten: flush any deferred
    /// creation still reading from it, because the bytes are going away.
    pub fn report_file_write(&self, path: &Path) {
        let pending = {
            let deferred = self.deferred.lock().unwrap();
            deferred.by_path.get(&PathKey::of(path)).copied()
        };
        if let Some(key) = pending {
            let _ = self.has_content(key);
        }
    }

    /// Invalidate a path's record and force-drop the content it referred
    /// to. Returns false when the path was never tracked.
    pub fn delete_content_for_file(&self, path: &Path) -> Result<bool> {
        let Some(record) = self.files.get(PathKey::of(path)) else {
            return Ok(false);
        };
        let key = {
            let mut st = record.state.lock().unwrap();
            st.verified = false;
            st.key
        };
        match key {
            Some(key) if !key.is_zero() => {
                self.drop_content(key, true)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // ------------------------------------------------------------------
    // Capacity / lifecycle
    // ------------------------------------------------------------------

    /// Evict oldest-first, unconditionally, until the store is under
    /// budget. For use when nothing is in flight (typically right after
    /// load).
    pub fn enforce_capacity(&self) {
        let capacity = self.cfg.capacity_bytes;
        if capacity == 0 {
            return;
        }
        let before = self.entries.tally().total_bytes;
        if before <= capacity {
            return;
        }
        let start = Instant::now();
        while let Some((id, entry)) = self.entries.oldest_if_over(capacity) {
            let key = entry.key;
            if let Err(e) = self.drop_content(key, true) {
                warn!(key = %key, error = %e, "failed to delete blob during capacity pass");
            }
            self.entries.erase(key, id);
        }
        let after = self.entries.tally().total_bytes;
        if before != after {
            info!(
                evicted_bytes = before - after,
                total_bytes = after,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "evicted storage to get under budget"
            );
        }
    }

    /// Wipe everything: tables, deferred creations, and all blobs on disk.
    pub fn reset(&self) -> Result<()> {
        self.entries.clear();
        self.files.clear();
        self.deferred.lock().unwrap().by_key.clear();
        self.deferred.lock().unwrap().by_path.clear();
        self.purge_blobs()?;
        Ok(())
    }

    /// Delete every blob on disk and recreate the directory skeleton.
    pub(crate) fn purge_blobs(&self) -> Result<()> {
        let cas = self.cas_dir();
        let mut deleted = 0u64;
        if cas.exists() {
            deleted = walkdir::WalkDir::new(&cas)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .count() as u64;
            fs::remove_dir_all(&cas)?;
        }
        fs::create_dir_all(&cas)?;
        self.clear_temp_dir();
        info!(count = deleted, "deleted all blobs");
        Ok(())
    }

    pub fn stats(&self) -> StorageStats {
        let tally = self.entries.tally();
        StorageStats {
            entry_count: self.entries.len(),
            file_record_count: self.files.len(),
            deferred_count: self.deferred.lock().unwrap().by_key.len(),
            total_bytes: tally.total_bytes,
            max_bytes: tally.max_bytes,
            evicted_count: tally.evicted_count,
            evicted_bytes: tally.evicted_bytes,
            dropped_count: tally.dropped_count,
            dropped_bytes: tally.dropped_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(temp: &TempDir) -> Storage {
        let mut cfg = StoreConfig::default();
        cfg.root_dir = temp.path().to_path_buf();
        let storage = Storage::new(cfg).unwrap();
        storage.load().unwrap();
        storage
    }

    #[test]
    fn test_blob_path_is_sharded() {
        let temp = TempDir::new().unwrap();
        let s = storage(&temp);
        let key = stash_codec::compute_key(b"shard me", true);
        let path = s.blob_path(key);
        let hex = key.to_hex();
        assert!(path.ends_with(Path::new(&hex[..2]).join(&hex)));
    }

    #[test]
    fn test_store_missing_file_returns_zero_key() {
        let temp = TempDir::new().unwrap();
        let s = storage(&temp);
        let key = s
            .store_file(&temp.path().join("does-not-exist"), None, false, false)
            .unwrap();
        assert!(key.is_zero());
    }

    #[test]
    fn test_resolve_key_uses_cache_until_invalidated() {
        let temp = TempDir::new().unwrap();
        let s = storage(&temp);
        let src = temp.path().join("src.bin");
        fs::write(&src, b"cached content").unwrap();

        let k1 = s.resolve_key(&src, None, false).unwrap();
        let k2 = s.resolve_key(&src, None, false).unwrap();
        assert_eq!(k1, k2);

        assert!(s.invalidate_file(&src));
        let k3 = s.resolve_key(&src, None, false).unwrap();
        assert_eq!(k1, k3);
    }

    #[test]
    fn test_override_key_is_trusted() {
        let temp = TempDir::new().unwrap();
        let s = storage(&temp);
        let src = temp.path().join("src.bin");
        fs::write(&src, b"whatever").unwrap();

        let fake = stash_codec::compute_key(b"claimed content", true);
        let key = s.resolve_key(&src, Some(fake), false).unwrap();
        assert_eq!(key, fake);
    }

    #[test]
    fn test_disallowed_path_flag() {
        let temp = TempDir::new().unwrap();
        let mut cfg = StoreConfig::default();
        cfg.root_dir = temp.path().to_path_buf();
        cfg.disallowed_paths = vec![temp.path().join("secrets")];
        let s = Storage::new(cfg).unwrap();
        s.load().unwrap();

        fs::create_dir_all(temp.path().join("secrets")).unwrap();
        let src = temp.path().join("secrets/key.pem");
        fs::write(&src, b"private").unwrap();
        let key = s.store_file(&src, None, false, false).unwrap();

        let dest = temp.path().join("out.pem");
        assert!(s.materialize_to(key, &dest).is_err());
    }
}
