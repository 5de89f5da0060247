//! Content keys.
//!
//! A [`ContentKey`] is a 32-byte BLAKE3-derived value whose last byte is
//! replaced by an encoding discriminator: 0 for raw storage, 1 for
//! block-compressed storage. Two keys differing only in that byte refer to
//! the same logical content in different physical encodings.
//!
//! Inputs longer than [`KEY_CHUNK_SIZE`] are keyed as a hash-of-hashes:
//! fixed-size chunks are hashed independently (in parallel) and the chunk
//! hashes are folded into the final key. Producers must partition
//! identically to agree on a key, which the fixed chunk size guarantees.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use rayon::prelude::*;

use crate::{BufferPool, BUFFER_SLOT_SIZE};

/// Partition size for the hash-of-hashes path.
pub const KEY_CHUNK_SIZE: usize = BUFFER_SLOT_SIZE;

/// A content hash plus an embedded compressed-encoding flag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey([u8; 32]);

impl ContentKey {
    /// All-zero sentinel: "no key" in tables, terminator in snapshots.
    pub const ZERO: ContentKey = ContentKey([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ContentKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Whether this key names the block-compressed encoding.
    pub fn is_compressed(&self) -> bool {
        self.0[31] != 0
    }

    /// The same logical content under the given encoding.
    pub fn as_compressed(mut self, compressed: bool) -> ContentKey {
        self.0[31] = compressed as u8;
        self
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<ContentKey> {
        if s.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(ContentKey(bytes))
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({})", &self.to_hex()[..16])
    }
}

impl Default for ContentKey {
    fn default() -> Self {
        Self::ZERO
    }
}

fn finalize(hasher: blake3::Hasher, compressed: bool) -> ContentKey {
    let mut bytes: [u8; 32] = hasher.finalize().into();
    bytes[31] = compressed as u8;
    ContentKey(bytes)
}

/// Compute the key for in-memory content.
///
/// Deterministic: same bytes and flag always give the same key. Inputs over
/// [`KEY_CHUNK_SIZE`] are keyed as a hash-of-hashes, so the result is not
/// the plain hash of the byte stream.
pub fn compute_key(data: &[u8], compressed: bool) -> ContentKey {
    if data.len() <= KEY_CHUNK_SIZE {
        let mut hasher = blake3::Hasher::new();
        hasher.update(data);
        return finalize(hasher, compressed);
    }

    let chunk_hashes: Vec<[u8; 32]> = data
        .par_chunks(KEY_CHUNK_SIZE)
        .map(|chunk| blake3::hash(chunk).into())
        .collect();

    let mut hasher = blake3::Hasher::new();
    for h in &chunk_hashes {
        hasher.update(h);
    }
    finalize(hasher, compressed)
}

/// The key of empty content under the given encoding.
pub fn empty_key(compressed: bool) -> ContentKey {
    compute_key(&[], compressed)
}

/// Compute the key for a file on disk.
///
/// Small files stream through a pool buffer; larger files are memory-mapped
/// and keyed through the parallel hash-of-hashes path.
pub fn compute_key_for_file(
    pool: &BufferPool,
    path: &Path,
    compressed: bool,
) -> std::io::Result<ContentKey> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    if len > KEY_CHUNK_SIZE as u64 {
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        return Ok(compute_key(&mmap, compressed));
    }

    let mut hasher = blake3::Hasher::new();
    let mut slot = pool.acquire();
    let mut left = len as usize;
    while left > 0 {
        let to_read = left.min(slot.len());
        file.read_exact(&mut slot[..to_read])?;
        hasher.update(&slot[..to_read]);
        left -= to_read;
    }
    Ok(finalize(hasher, compressed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_key_determinism() {
        let data = b"some content";
        assert_eq!(compute_key(data, false), compute_key(data, false));
        assert_eq!(compute_key(data, true), compute_key(data, true));
    }

    #[test]
    fn test_compressed_flag_separates_keys() {
        let data = b"some content";
        let raw = compute_key(data, false);
        let comp = compute_key(data, true);
        assert_ne!(raw, comp);
        assert!(!raw.is_compressed());
        assert!(comp.is_compressed());
        assert_eq!(raw.as_compressed(true), comp);
        assert_eq!(comp.as_compressed(false), raw);
    }

    #[test]
    fn test_hash_of_hashes_boundary() {
        // One byte over the chunk size switches to the chunked path; the key
        // must stay deterministic on both sides of the boundary.
        let small = vec![7u8; KEY_CHUNK_SIZE];
        let large = vec![7u8; KEY_CHUNK_SIZE + 1];
        assert_eq!(compute_key(&small, false), compute_key(&small, false));
        assert_eq!(compute_key(&large, false), compute_key(&large, false));
        assert_ne!(compute_key(&small, false), compute_key(&large, false));
    }

    #[test]
    fn test_hex_roundtrip() {
        let key = compute_key(b"roundtrip", true);
        let parsed = ContentKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key, parsed);
        assert!(ContentKey::from_hex("zz").is_none());
    }

    #[test]
    fn test_file_key_matches_memory_key() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BufferPool::new();

        let small_path = dir.path().join("small.bin");
        let mut f = File::create(&small_path).unwrap();
        f.write_all(b"file content").unwrap();
        drop(f);
        assert_eq!(
            compute_key_for_file(&pool, &small_path, false).unwrap(),
            compute_key(b"file content", false)
        );

        let large = vec![3u8; KEY_CHUNK_SIZE + 4096];
        let large_path = dir.path().join("large.bin");
        std::fs::write(&large_path, &large).unwrap();
        assert_eq!(
            compute_key_for_file(&pool, &large_path, true).unwrap(),
            compute_key(&large, true)
        );
    }

    #[test]
    fn test_empty_key() {
        assert_eq!(empty_key(false), compute_key(&[], false));
        assert_ne!(empty_key(false), empty_key(true));
        assert!(!empty_key(false).is_zero());
    }
}
