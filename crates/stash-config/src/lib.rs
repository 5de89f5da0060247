//! # stash-config
//!
//! Configuration for the Stash storage engine.
//!
//! Loads configuration from:
//! 1. `~/.stash/config.toml` (global)
//! 2. `.stash/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! The resulting [`StoreConfig`] is plain data: it is handed to the storage
//! engine at construction time and never consulted ambiently.

pub mod logging;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Storage engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the store (blobs, snapshot, crash marker).
    pub root_dir: PathBuf,
    /// Byte budget for tracked blobs. 0 disables eviction.
    pub capacity_bytes: u64,
    /// Store new blobs block-compressed.
    pub store_compressed: bool,
    /// Compression level handed to the block codec.
    pub compression_level: u32,
    /// Cap on simultaneous materializations.
    pub max_parallel_materialize: u32,
    /// Worker threads for block-parallel compress/decompress. 0 = one per core.
    pub worker_threads: usize,
    /// Path prefixes that must never enter the store.
    pub disallowed_paths: Vec<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        Self {
            root_dir: home.join(".stash"),
            capacity_bytes: 0,
            store_compressed: true,
            compression_level: 6,
            max_parallel_materialize: 8,
            worker_threads: 0,
            disallowed_paths: Vec::new(),
        }
    }
}

impl StoreConfig {
    /// Load config from the standard locations.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = StoreConfig::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("loading global config from {:?}", global_path);
                config = Self::from_file(&global_path)?;
            }
        }

        let project_path = Path::new(".stash/config.toml");
        if project_path.exists() {
            debug!("loading project config from {:?}", project_path);
            config = Self::from_file(project_path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load config from a specific TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: `~/.stash/config.toml`
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".stash/config.toml"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("STASH_ROOT") {
            self.root_dir = PathBuf::from(path);
        }
        if let Ok(cap) = std::env::var("STASH_CAPACITY_BYTES") {
            if let Ok(n) = cap.parse() {
                self.capacity_bytes = n;
            }
        }
        if let Ok(threads) = std::env::var("STASH_THREADS") {
            if let Ok(n) = threads.parse() {
                self.worker_threads = n;
            }
        }
    }

    /// Generate the default config as a TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&StoreConfig::default()).unwrap()
    }
}
