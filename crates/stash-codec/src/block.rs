//! Framed block compression.
//!
//! A payload is an 8-byte total-decompressed-size header followed by
//! independently compressed blocks, each framed as
//! `[compressed_len: u32][decompressed_len: u32][bytes]`. Independent blocks
//! enable block-level parallelism on both sides.
//!
//! Encode workers claim block indices from a shared atomic cursor and commit
//! their output in strict index order, gated on one completion event per
//! block. Decode validates the frame headers up front (the primary
//! corruption-detection point) and fans large payloads out across workers
//! claiming blocks from the same kind of cursor, each writing its own
//! disjoint output slice. In both directions a shared error flag stops new
//! claims and the operation reports failure only once every worker has
//! drained.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::{CodecError, Result, BUFFER_SLOT_SIZE};

/// Default raw-block size for encoding.
pub const DEFAULT_MAX_BLOCK: usize = BUFFER_SLOT_SIZE / 2;

/// Payloads decompressing to more than this run block-parallel.
const PARALLEL_DECODE_THRESHOLD: usize = BUFFER_SLOT_SIZE * 4;

const BLOCK_HEADER_LEN: usize = 8;

/// A pluggable block compressor with a selectable level.
pub trait BlockCodec: Send + Sync {
    /// Compress `src` into `dst` (appended).
    fn compress(&self, level: u32, src: &[u8], dst: &mut Vec<u8>) -> Result<()>;

    /// Decompress `src`, filling `dst` exactly. Returns the byte count.
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize>;

    fn name(&self) -> &'static str;
}

/// DEFLATE-backed codec.
pub struct DeflateCodec;

impl BlockCodec for DeflateCodec {
    fn compress(&self, level: u32, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        let mut enc =
            flate2::write::DeflateEncoder::new(dst, flate2::Compression::new(level.min(9)));
        enc.write_all(src)?;
        enc.finish()?;
        Ok(())
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let mut dec = flate2::read::DeflateDecoder::new(src);
        let mut filled = 0;
        while filled < dst.len() {
            match dec.read(&mut dst[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(CodecError::Corrupt(format!("inflate failed: {e}"))),
            }
        }
        if filled != dst.len() {
            return Err(CodecError::Corrupt(format!(
                "block decompressed to {filled} bytes, expected {}",
                dst.len()
            )));
        }
        let mut probe = [0u8; 1];
        match dec.read(&mut probe) {
            Ok(0) => Ok(filled),
            _ => Err(CodecError::Corrupt(
                "block decompressed larger than its header claims".into(),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "deflate"
    }
}

/// One-shot completion signal, set once and observed by any number of waiters.
struct Event {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn set(&self) {
        *self.state.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut set = self.state.lock().unwrap();
        while !*set {
            set = self.cond.wait(set).unwrap();
        }
    }
}

fn write_block<W: Write>(out: &mut W, compressed: &[u8], raw_len: u32) -> std::io::Result<()> {
    out.write_all(&(compressed.len() as u32).to_le_bytes())?;
    out.write_all(&raw_len.to_le_bytes())?;
    out.write_all(compressed)
}

/// Block-stream encoder.
pub struct BlockEncoder<'a> {
    codec: &'a dyn BlockCodec,
    level: u32,
    pub max_block: usize,
    pub workers: usize,
}

impl<'a> BlockEncoder<'a> {
    pub fn new(codec: &'a dyn BlockCodec, level: u32) -> Self {
        Self {
            codec,
            level,
            max_block: DEFAULT_MAX_BLOCK,
            workers: num_cpus::get(),
        }
    }

    /// Encode `src` as a framed block stream. Returns total bytes written.
    pub fn encode<W: Write + Send>(&self, src: &[u8], out: &mut W) -> Result<u64> {
        out.write_all(&(src.len() as u64).to_le_bytes())?;

        let count = src.len().div_ceil(self.max_block);
        if count <= 1 || self.workers <= 1 {
            let mut total = 8u64;
            let mut scratch = Vec::new();
            for chunk in src.chunks(self.max_block) {
                scratch.clear();
                self.codec.compress(self.level, chunk, &mut scratch)?;
                write_block(out, &scratch, chunk.len() as u32)?;
                total += (BLOCK_HEADER_LEN + scratch.len()) as u64;
            }
            return Ok(total);
        }

        let cursor = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let written = AtomicU64::new(0);
        let first_err: Mutex<Option<CodecError>> = Mutex::new(None);
        let events: Vec<Event> = (0..count).map(|_| Event::new()).collect();
        let out = Mutex::new(out);

        std::thread::scope(|s| {
            for _ in 0..self.workers.min(count) {
                s.spawn(|| {
                    let mut scratch = Vec::new();
                    loop {
                        let index = cursor.fetch_add(1, Ordering::SeqCst);
                        if index >= count {
                            return;
                        }
                        let start = index * self.max_block;
                        let end = (start + self.max_block).min(src.len());

                        let mut block_err = None;
                        scratch.clear();
                        if !failed.load(Ordering::SeqCst) {
                            if let Err(e) = self.codec.compress(self.level, &src[start..end], &mut scratch)
                            {
                                block_err = Some(e);
                            }
                        }

                        // Commits happen in index order: wait for the
                        // previous block's commit before writing ours.
                        if index > 0 {
                            events[index - 1].wait();
                        }
                        if block_err.is_none() && !failed.load(Ordering::SeqCst) {
                            let mut w = out.lock().unwrap();
                            match write_block(&mut **w, &scratch, (end - start) as u32) {
                                Ok(()) => {
                                    written.fetch_add(
                                        (BLOCK_HEADER_LEN + scratch.len()) as u64,
                                        Ordering::SeqCst,
                                    );
                                }
                                Err(e) => block_err = Some(e.into()),
                            }
                        }
                        if let Some(e) = block_err {
                            failed.store(true, Ordering::SeqCst);
                            first_err.lock().unwrap().get_or_insert(e);
                        }
                        // Always signal, even on failure, so waiters drain.
                        events[index].set();
                    }
                });
            }
        });

        if let Some(e) = first_err.into_inner().unwrap() {
            return Err(e);
        }
        Ok(8 + written.into_inner())
    }
}

struct BlockSpan {
    src_start: usize,
    src_len: usize,
    dst_len: usize,
}

/// Walk the frame headers, validating every block against the remaining
/// input and output. This is where corrupt streams are caught.
fn scan_blocks(blocks: &[u8], decompressed_total: u64) -> Result<Vec<BlockSpan>> {
    let total = decompressed_total as usize;
    let mut spans = Vec::new();
    let mut src = 0usize;
    let mut dst = 0usize;

    while dst < total {
        if blocks.len() - src < BLOCK_HEADER_LEN {
            return Err(CodecError::Corrupt(format!(
                "missing block header at offset {src}"
            )));
        }
        let compressed = u32::from_le_bytes(blocks[src..src + 4].try_into().unwrap()) as usize;
        let decompressed = u32::from_le_bytes(blocks[src + 4..src + 8].try_into().unwrap()) as usize;
        src += BLOCK_HEADER_LEN;

        if decompressed == 0 || decompressed > total - dst {
            return Err(CodecError::Corrupt(format!(
                "decompressed block size {decompressed} is invalid, {} bytes of output remain",
                total - dst
            )));
        }
        if compressed == 0 || compressed > blocks.len() - src {
            return Err(CodecError::Corrupt(format!(
                "compressed block size {compressed} is larger than the {} bytes remaining",
                blocks.len() - src
            )));
        }

        spans.push(BlockSpan {
            src_start: src,
            src_len: compressed,
            dst_len: decompressed,
        });
        src += compressed;
        dst += decompressed;
    }
    Ok(spans)
}

/// Structural check of a full payload (header plus blocks) without
/// decompressing anything. Returns the claimed decompressed size.
pub fn validate_stream(payload: &[u8]) -> Result<u64> {
    if payload.len() < 8 {
        return Err(CodecError::Corrupt(format!(
            "payload is {} bytes, need at least 8",
            payload.len()
        )));
    }
    let total = u64::from_le_bytes(payload[..8].try_into().unwrap());
    scan_blocks(&payload[8..], total)?;
    Ok(total)
}

/// Block-stream decoder.
pub struct BlockDecoder<'a> {
    codec: &'a dyn BlockCodec,
    pub workers: usize,
}

impl<'a> BlockDecoder<'a> {
    pub fn new(codec: &'a dyn BlockCodec) -> Self {
        Self {
            codec,
            workers: num_cpus::get(),
        }
    }

    /// Decode a full payload (header plus blocks) into a fresh buffer.
    ///
    /// The structural scan runs before the output allocation so a corrupt
    /// size header cannot drive an absurd allocation.
    pub fn decode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let total = validate_stream(payload)?;
        let mut out = vec![0u8; total as usize];
        self.decode_into(&payload[8..], &mut out)?;
        Ok(out)
    }

    /// Decode a block section into an exactly-sized output buffer.
    pub fn decode_into(&self, blocks: &[u8], dst: &mut [u8]) -> Result<()> {
        let spans = scan_blocks(blocks, dst.len() as u64)?;

        if dst.len() <= PARALLEL_DECODE_THRESHOLD || self.workers <= 1 || spans.len() <= 1 {
            let mut offset = 0usize;
            for span in &spans {
                let src = &blocks[span.src_start..span.src_start + span.src_len];
                let n = self.codec.decompress(src, &mut dst[offset..offset + span.dst_len])?;
                debug_assert_eq!(n, span.dst_len);
                offset += span.dst_len;
            }
            return Ok(());
        }

        // Pre-split the output into disjoint per-block slices, then let
        // workers claim block indices from the cursor.
        let mut slices: Vec<Option<&mut [u8]>> = Vec::with_capacity(spans.len());
        let mut rest: &mut [u8] = dst;
        for span in &spans {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(span.dst_len);
            slices.push(Some(head));
            rest = tail;
        }
        let slices = Mutex::new(slices);
        let cursor = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let first_err: Mutex<Option<CodecError>> = Mutex::new(None);

        std::thread::scope(|s| {
            for _ in 0..self.workers.min(spans.len()) {
                s.spawn(|| loop {
                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    if index >= spans.len() || failed.load(Ordering::SeqCst) {
                        return;
                    }
                    let span = &spans[index];
                    let target = slices.lock().unwrap()[index].take().unwrap();
                    let src = &blocks[span.src_start..span.src_start + span.src_len];
                    if let Err(e) = self.codec.decompress(src, target) {
                        failed.store(true, Ordering::SeqCst);
                        first_err.lock().unwrap().get_or_insert(e);
                    }
                });
            }
        });

        match first_err.into_inner().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
