//! Materialization: turning a stored entry back into a concrete file.
//!
//! Raw blobs are hardlinked to the destination, falling back to reflink and
//! then a byte copy; compressed blobs decompress straight into a mapped,
//! pre-sized destination file. A counted gate bounds how many
//! materializations run at once, with a periodic wake so waiters stay
//! responsive.

use std::fs::{self, File};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, error, warn};

use stash_codec::{BlockDecoder, ContentKey};

use crate::file_table::{mtime_nanos, FileRecord, PathKey};
use crate::store::Storage;
use crate::{Result, StoreError};

/// Caps simultaneous materializations at a configured maximum.
pub(crate) struct MaterializeGate {
    active: Mutex<u32>,
    cond: Condvar,
}

pub(crate) struct GateGuard<'a> {
    gate: &'a MaterializeGate,
}

impl MaterializeGate {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn acquire(&self, max: u32) -> GateGuard<'_> {
        let max = max.max(1);
        let mut active = self.active.lock().unwrap();
        while *active >= max {
            let (guard, _) = self
                .cond
                .wait_timeout(active, Duration::from_secs(2))
                .unwrap();
            active = guard;
        }
        *active += 1;
        GateGuard { gate: self }
    }

    #[cfg(test)]
    fn active(&self) -> u32 {
        *self.active.lock().unwrap()
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        *self.gate.active.lock().unwrap() -= 1;
        self.gate.cond.notify_all();
    }
}

/// Hardlink, then reflink, then byte copy. An already-existing destination
/// surfaces as an error for the caller's delete-and-retry.
fn link_or_copy(blob: &Path, dest: &Path) -> std::io::Result<()> {
    match fs::hard_link(blob, dest) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Err(e),
        Err(_) => {}
    }
    if reflink_copy::reflink(blob, dest).is_ok() {
        return Ok(());
    }
    fs::copy(blob, dest).map(|_| ())
}

impl Storage {
    /// Materialize `key`'s content into `dest`, trying both physical
    /// encodings of the key. The destination's file record is refreshed so
    /// a follow-up store of `dest` skips re-hashing.
    pub fn materialize_to(&self, key: ContentKey, dest: &Path) -> Result<()> {
        if key.is_zero() {
            return Err(StoreError::NotFound { key });
        }
        let _slot = self.gate.acquire(self.cfg.max_parallel_materialize);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let record = self.files.get_or_create(PathKey::of(dest));

        // Hardlinking the raw encoding is cheapest, so probe it first and
        // fall back to the compressed variant.
        let mut probe = key.as_compressed(false);
        let mut tried_fallback = false;
        loop {
            let present = self.has_content_inner(probe)?;
            let found = if present { self.entries.find(probe) } else { None };
            let Some((_, entry)) = found else {
                if !tried_fallback {
                    probe = key.as_compressed(true);
                    tried_fallback = true;
                    continue;
                }
                error!(key = %key, dest = %dest.display(),
                    "neither encoding of the key is present in the store");
                return Err(StoreError::NotFound { key });
            };

            let st = entry.state.read().unwrap();
            if !st.verified || !st.exists {
                drop(st);
                if !tried_fallback {
                    probe = key.as_compressed(true);
                    tried_fallback = true;
                    continue;
                }
                return Err(StoreError::NotFound { key });
            }
            if st.disallowed {
                return Err(StoreError::Unsupported(
                    "content from a disallowed path is not materialized",
                ));
            }

            let result = if probe.is_compressed() {
                self.materialize_decompress(probe, dest, &record)
            } else {
                self.materialize_link(probe, dest, &record)
            };
            drop(st);

            return match result {
                Err(StoreError::Codec(e)) => {
                    // Corrupt blob: delete it so it is never trusted again.
                    warn!(key = %probe, error = %e, "blob failed to decode, dropping it");
                    let _ = self.drop_content(probe, true);
                    let _ = fs::remove_file(dest);
                    Err(StoreError::Codec(e))
                }
                other => other,
            };
        }
    }

    fn materialize_link(
        &self,
        key: ContentKey,
        dest: &Path,
        record: &Arc<FileRecord>,
    ) -> Result<()> {
        let mut rst = record.state.lock().unwrap();
        rst.verified = false;

        let blob = self.blob_path(key);
        if let Err(first) = link_or_copy(&blob, dest) {
            debug!(dest = %dest.display(), error = %first, "link failed, retrying after delete");
            let _ = fs::remove_file(dest);
            if let Err(e) = link_or_copy(&blob, dest) {
                error!(blob = %blob.display(), dest = %dest.display(), error = %e,
                    "failed to link or copy blob");
                return Err(e.into());
            }
        }

        let meta = fs::metadata(dest)?;
        rst.size = meta.len();
        rst.last_modified = mtime_nanos(&meta);
        rst.key = Some(key.as_compressed(self.cfg.store_compressed));
        rst.verified = true;
        Ok(())
    }

    fn materialize_decompress(
        &self,
        key: ContentKey,
        dest: &Path,
        record: &Arc<FileRecord>,
    ) -> Result<()> {
        let mut rst = record.state.lock().unwrap();
        rst.verified = false;

        let blob = self.blob_path(key);
        let file = File::open(&blob)?;
        if file.metadata()?.len() < 8 {
            return Err(stash_codec::CodecError::Corrupt(
                "blob is shorter than its size header".into(),
            )
            .into());
        }
        let payload = unsafe { memmap2::Mmap::map(&file)? };
        // Validate the frame structure before touching the destination, so
        // a corrupt size header cannot produce an absurd destination file.
        let total = stash_codec::validate_stream(&payload)?;

        let out = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dest)?;
        if total > 0 {
            out.set_len(total)?;
            let mut mapped = unsafe { memmap2::MmapMut::map_mut(&out)? };
            let mut decoder = BlockDecoder::new(&*self.codec);
            decoder.workers = self.workers;
            decoder.decode_into(&payload[8..], &mut mapped)?;
            mapped.flush()?;
        }

        let meta = out.metadata()?;
        rst.size = total;
        rst.last_modified = mtime_nanos(&meta);
        rst.key = Some(key.as_compressed(self.cfg.store_compressed));
        rst.verified = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    #[test]
    fn test_gate_bounds_concurrency() {
        let gate = StdArc::new(MaterializeGate::new());
        let a = gate.acquire(2);
        let _b = gate.acquire(2);
        assert_eq!(gate.active(), 2);

        let gate2 = gate.clone();
        let handle = std::thread::spawn(move || {
            let _c = gate2.acquire(2); // blocks until a slot frees
            gate2.active()
        });
        std::thread::sleep(Duration::from_millis(50));
        drop(a);
        assert_eq!(handle.join().unwrap(), 2);
        assert_eq!(gate.active(), 1);
    }
}
