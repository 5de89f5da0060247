//! # stash-cas
//!
//! Content-addressable blob cache for build artifacts.
//!
//! Blobs are keyed by a BLAKE3-derived [`ContentKey`] and stored one file
//! per key under a sharded directory, raw or block-compressed. The engine
//! keeps a verified-file cache so unchanged inputs skip re-hashing, evicts
//! least-recently-used blobs against a byte budget, and persists its whole
//! index to a single snapshot file with crash reconciliation against the
//! blob directory.
//!
//! [`Storage`] is an explicit service object: construct it with a
//! [`StoreConfig`], call [`Storage::load`] before use and
//! [`Storage::close`] at shutdown.
//!
//! ```no_run
//! use std::path::Path;
//! use stash_cas::Storage;
//! use stash_config::StoreConfig;
//!
//! let mut cfg = StoreConfig::default();
//! cfg.root_dir = "/var/cache/stash".into();
//! let storage = Storage::new(cfg)?;
//! storage.load()?;
//! let key = storage.store_file(Path::new("input.o"), None, false, false)?;
//! storage.materialize_to(key, Path::new("output.o"))?;
//! storage.close()?;
//! # Ok::<(), stash_cas::StoreError>(())
//! ```

mod entry;
mod file_table;
mod materialize;
mod snapshot;
mod store;

pub use store::{Storage, StorageStats};

pub use stash_codec::ContentKey;

use thiserror::Error;

/// Errors from storage operations.
///
/// I/O failures are transient: callers may retry. Corruption is handled
/// internally (the offending blob is deleted) and surfaces here only to
/// report that the requested content is gone.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] stash_codec::CodecError),

    #[error("content not found: {key}")]
    NotFound { key: ContentKey },

    #[error("{0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, StoreError>;
