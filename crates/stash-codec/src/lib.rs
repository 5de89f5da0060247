//! # stash-codec
//!
//! Leaf primitives for the Stash storage engine:
//!
//! - [`BufferPool`]: reusable scratch buffers for block I/O
//! - [`ContentKey`]: BLAKE3-derived content keys with an encoding flag,
//!   computed as a hash-of-hashes for large inputs
//! - [`BlockCodec`] / [`BlockEncoder`] / [`BlockDecoder`]: framed,
//!   block-parallel compression with a pluggable compressor
//!
//! ## Payload format
//!
//! ```text
//! [decompressed_total: u64 LE]
//! repeated:
//!   [compressed_len: u32 LE][decompressed_len: u32 LE][compressed bytes]
//! ```

mod block;
mod buffer;
mod key;

pub use block::{
    validate_stream, BlockCodec, BlockDecoder, BlockEncoder, DeflateCodec, DEFAULT_MAX_BLOCK,
};
pub use buffer::{BufferPool, PoolBuffer, BUFFER_SLOT_SIZE};
pub use key::{compute_key, compute_key_for_file, empty_key, ContentKey, KEY_CHUNK_SIZE};

use thiserror::Error;

/// Errors from hashing and block coding.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt block stream: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;
