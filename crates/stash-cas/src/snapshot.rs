//! Snapshot persistence and crash reconciliation.
//!
//! The whole index is saved to a single versioned file:
//!
//! ```text
//! [version: u32][file_record_count: u32][entry_count: u32]
//! file records: [path_key: 32B][size: u64][last_modified: u64][key: 32B]
//! entries, newest first: [key: 32B][size: u64]
//! terminator: 32 zero bytes
//! ```
//!
//! A `.running` marker is created at load and deleted at clean shutdown;
//! finding it at the next load means the previous run died, and the index
//! is rebuilt from what is actually in the blob directory rather than
//! trusted from the stale snapshot.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use stash_codec::{empty_key, validate_stream, ContentKey};

use crate::file_table::PathKey;
use crate::store::Storage;
use crate::Result;

pub(crate) const SNAPSHOT_VERSION: u32 = 3;

enum SnapshotLoad {
    Missing,
    Loaded,
    VersionMismatch,
    Corrupt,
}

struct FoundBlob {
    key: ContentKey,
    path: PathBuf,
    size: u64,
    corrupt: bool,
}

impl Storage {
    /// Load the index. Must be called once, before any other operation.
    ///
    /// Handles the three recovery paths: version mismatch (purge and start
    /// empty), corrupt snapshot (rebuild from the blob directory), and
    /// non-graceful shutdown (full reconciliation scan).
    pub fn load(&self) -> Result<()> {
        let mut loaded = self.loaded.lock().unwrap();
        if *loaded {
            debug_assert!(!*loaded, "load called twice");
            return Ok(());
        }
        *loaded = true;

        let start = Instant::now();
        let marker = self.marker_path();
        let was_unclean = marker.exists();
        let marker_mtime = fs::metadata(&marker).ok().and_then(|m| m.modified().ok());
        if !was_unclean {
            File::create(&marker)?;
        }

        let mut need_resave = false;
        let mut reconcile_from = None;
        if was_unclean {
            reconcile_from = Some(marker_mtime);
        }

        match self.read_snapshot(&self.snapshot_path()) {
            SnapshotLoad::Missing | SnapshotLoad::Loaded => {}
            SnapshotLoad::VersionMismatch => {
                info!("snapshot format version changed, deleting all blobs");
                self.purge_blobs()?;
                need_resave = true;
                reconcile_from = None;
            }
            SnapshotLoad::Corrupt => {
                warn!("snapshot is corrupt, rebuilding the index from the blob directory");
                reconcile_from = Some(None); // check every blob's content
                need_resave = true;
            }
        }

        if let Some(newer_than) = reconcile_from {
            if was_unclean {
                info!(root = %self.root().display(),
                    "previous run was not gracefully shut down, reparsing the blob directory");
            }
            self.reconcile(newer_than)?;
            need_resave = true;
            // Refresh the marker so the next unclean-shutdown scan only
            // content-checks blobs written after this point.
            let _ = File::create(&marker);
        }

        self.enforce_capacity();
        drop(loaded);

        if need_resave {
            self.save()?;
        }

        let tally = self.entries.tally();
        info!(
            entries = self.entries.len(),
            total_bytes = tally.total_bytes,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "storage index loaded"
        );
        Ok(())
    }

    /// Save the index snapshot. Deferred (soft) drops complete here.
    pub fn save(&self) -> Result<()> {
        self.save_inner(false)
    }

    /// Save the index and mark the shutdown clean.
    pub fn close(&self) -> Result<()> {
        self.save_inner(true)
    }

    fn save_inner(&self, clean_shutdown: bool) -> Result<()> {
        let loaded = self.loaded.lock().unwrap();
        if !*loaded {
            return Ok(());
        }

        let file_records = self.files.collect();
        let mru = self.entries.collect_mru();

        // Complete deferred physical deletes and pick what survives the
        // snapshot: dropped and confirmed-missing entries are skipped.
        let mut survivors: Vec<(ContentKey, u64)> = Vec::with_capacity(mru.len());
        for (id, entry) in &mru {
            let mut st = entry.state.write().unwrap();
            if st.dropped {
                match fs::remove_file(self.blob_path(entry.key)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        error!(key = %entry.key, error = %e, "failed to delete dropped blob");
                        continue; // stays dropped, retried next save
                    }
                }
                let size = st.size;
                st.dropped = false;
                st.verified = true;
                st.exists = false;
                st.size = 0;
                drop(st);
                self.entries.record_dropped(*id, size);
                continue;
            }
            if st.verified && !st.exists {
                continue;
            }
            debug_assert!(!entry.key.is_zero());
            survivors.push((entry.key, st.size));
        }

        let snapshot = self.snapshot_path();
        let tmp = snapshot.with_extension("tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            out.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
            out.write_all(&(file_records.len() as u32).to_le_bytes())?;
            out.write_all(&(survivors.len() as u32).to_le_bytes())?;
            for (path_key, size, mtime, key) in &file_records {
                out.write_all(&path_key.0)?;
                out.write_all(&size.to_le_bytes())?;
                out.write_all(&mtime.to_le_bytes())?;
                out.write_all(key.as_bytes())?;
            }
            for (key, size) in &survivors {
                out.write_all(key.as_bytes())?;
                out.write_all(&size.to_le_bytes())?;
            }
            out.write_all(ContentKey::ZERO.as_bytes())?;
            out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
        fs::rename(&tmp, &snapshot)?;

        if clean_shutdown {
            let _ = fs::remove_file(self.marker_path());
        }
        let tally = self.entries.tally();
        if tally.overflow_reported {
            info!(
                needed_bytes = tally.max_bytes,
                "session needed more storage than the configured capacity"
            );
        }
        debug!(
            entries = survivors.len(),
            files = file_records.len(),
            "snapshot saved"
        );
        Ok(())
    }

    fn read_snapshot(&self, path: &Path) -> SnapshotLoad {
        let data = match fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SnapshotLoad::Missing,
            Err(e) => {
                warn!(error = %e, "failed to read snapshot file");
                return SnapshotLoad::Corrupt;
            }
        };
        if data.len() < 12 {
            return self.discard_corrupt("snapshot is shorter than its header");
        }
        let version = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if version != SNAPSHOT_VERSION {
            return SnapshotLoad::VersionMismatch;
        }
        let file_count = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let _entry_count = u32::from_le_bytes(data[8..12].try_into().unwrap());
        let mut pos = 12usize;

        for _ in 0..file_count {
            if data.len().saturating_sub(pos) < 80 {
                return self.discard_corrupt("truncated file record");
            }
            let path_key = PathKey(data[pos..pos + 32].try_into().unwrap());
            let size = u64::from_le_bytes(data[pos + 32..pos + 40].try_into().unwrap());
            let mtime = u64::from_le_bytes(data[pos + 40..pos + 48].try_into().unwrap());
            let key = ContentKey::from_bytes(data[pos + 48..pos + 80].try_into().unwrap());
            pos += 80;
            if key.is_zero() {
                continue;
            }
            let key = key.as_compressed(self.cfg.store_compressed);
            self.files.insert_loaded(path_key, size, mtime, key);
        }

        // Entries were written newest-first; appending each at the cold end
        // reproduces the access order.
        loop {
            if data.len().saturating_sub(pos) < 32 {
                return self.discard_corrupt("missing entry terminator");
            }
            let key = ContentKey::from_bytes(data[pos..pos + 32].try_into().unwrap());
            pos += 32;
            if key.is_zero() {
                break;
            }
            if data.len().saturating_sub(pos) < 8 {
                return self.discard_corrupt("truncated entry");
            }
            let size = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
            pos += 8;
            if self.entries.find(key).is_some() {
                warn!(key = %key, "snapshot contains the same key twice");
                return self.discard_corrupt("duplicate entry key");
            }
            let (id, entry) = self.entries.find_or_insert(key);
            {
                let mut st = entry.state.write().unwrap();
                st.size = size;
                st.exists = true;
                st.verified = false;
            }
            self.entries.insert_loaded(id, size);
        }
        SnapshotLoad::Loaded
    }

    fn discard_corrupt(&self, why: &str) -> SnapshotLoad {
        warn!(why, "discarding snapshot");
        self.entries.clear();
        self.files.clear();
        SnapshotLoad::Corrupt
    }

    /// Rebuild the entry table from the physical blob directory.
    ///
    /// Blobs written after `check_newer_than` (or all of them, when `None`)
    /// get their block structure validated; corrupt and unparseable files
    /// are deleted. Entries whose blob is gone are removed, survivors are
    /// left unverified so the eviction walk may take them, and the byte
    /// tally is recounted.
    pub(crate) fn reconcile(&self, check_newer_than: Option<SystemTime>) -> Result<()> {
        let start = Instant::now();
        let before = self.entries.tally().total_bytes;
        self.entries.reset_total();

        let cas = self.cas_dir();
        let shard_dirs: Vec<PathBuf> = fs::read_dir(&cas)?
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect();

        let found: Vec<FoundBlob> = shard_dirs
            .par_iter()
            .flat_map_iter(|dir| scan_shard(dir, check_newer_than))
            .collect();

        let mut deleted = 0u32;
        for blob in found {
            if blob.corrupt {
                info!(path = %blob.path.display(), "deleting corrupt blob");
                if let Err(e) = fs::remove_file(&blob.path) {
                    error!(path = %blob.path.display(), error = %e, "failed to delete corrupt blob");
                }
                deleted += 1;
                continue;
            }
            let (id, entry) = self.entries.find_or_insert(blob.key);
            {
                let mut st = entry.state.write().unwrap();
                if st.exists && st.size != 0 && st.size != blob.size {
                    debug!(key = %blob.key, recorded = st.size, actual = blob.size,
                        "blob size differs from the table's record");
                }
                st.verified = true; // seen on disk this scan
                st.exists = true;
                st.size = blob.size;
            }
            self.entries.attach_oldest(id);
            self.entries.add_total(blob.size);
        }

        // Entries the scan did not see have no blob: remove them. Unmark
        // the survivors so they are evictable again.
        let mut missing = 0u32;
        for (key, id, entry) in self.entries.all_entries() {
            let mut st = entry.state.write().unwrap();
            if st.verified {
                st.verified = false;
            } else {
                st.exists = false;
                st.size = 0;
                drop(st);
                self.entries.erase(key, id);
                missing += 1;
            }
        }
        if missing > 0 {
            info!(count = missing, "dropped entries that had no blob on disk");
        }
        if deleted > 0 {
            info!(count = deleted, "deleted corrupt blobs");
        }

        let after = self.entries.tally().total_bytes;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        if before != after {
            info!(from = before, to = after, elapsed_ms, "corrected storage size");
        } else {
            info!(total_bytes = after, elapsed_ms, "validated storage");
        }
        Ok(())
    }
}

fn scan_shard(dir: &Path, check_newer_than: Option<SystemTime>) -> Vec<FoundBlob> {
    let mut out = Vec::new();
    let Ok(read_dir) = fs::read_dir(dir) else {
        return out;
    };
    for entry in read_dir.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(key) = name.to_str().and_then(ContentKey::from_hex) else {
            warn!(path = %entry.path().display(), "deleting unrecognized file in blob directory");
            let _ = fs::remove_file(entry.path());
            continue;
        };
        let size = meta.len();
        let mut corrupt = size == 0 && key != empty_key(key.is_compressed());

        let recent = check_newer_than
            .map_or(true, |t| meta.modified().map(|m| m >= t).unwrap_or(true));
        if !corrupt && size > 0 && recent && key.is_compressed() {
            corrupt = match File::open(entry.path()) {
                Ok(f) => match unsafe { memmap2::Mmap::map(&f) } {
                    Ok(mapped) => validate_stream(&mapped).is_err(),
                    Err(_) => true,
                },
                Err(_) => true,
            };
        }
        out.push(FoundBlob {
            key,
            path: entry.path(),
            size,
            corrupt,
        });
    }
    out
}
