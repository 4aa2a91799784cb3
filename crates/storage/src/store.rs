//! sled-backed durable store
//!
//! Wraps a single `sled::Db` with the two knobs the ledger depends on:
//! read-only opening and flush-on-write durability.

use serde::{Deserialize, Serialize};
use sled::Tree;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Store is opened read-only")]
    ReadOnly,

    #[error("No database at {0:?}")]
    Missing(PathBuf),

    #[error("Corrupt value under {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Codec error: {0}")]
    Codec(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database directory
    pub path: PathBuf,

    /// Reject every mutation
    #[serde(default)]
    pub read_only: bool,

    /// fsync after every committed write
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,

    /// Page cache size in bytes
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

fn default_sync_writes() -> bool { true }
fn default_cache_capacity() -> u64 { 64 * 1024 * 1024 }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./_db_data"),
            read_only: false,
            sync_writes: default_sync_writes(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

/// Crash-safe key-value store shared by every request handler
pub struct DurableStore {
    db: sled::Db,
    config: StoreConfig,
}

impl DurableStore {
    /// Create or open the store
    ///
    /// sled holds an exclusive file lock for the lifetime of the handle, so a
    /// second open of the same path fails while the first is alive, read-only
    /// or not. A read-only open never creates a database.
    pub fn open(config: StoreConfig) -> StorageResult<Self> {
        info!(
            "Opening store at {:?} (read_only={}, sync_writes={})",
            config.path, config.read_only, config.sync_writes
        );

        if config.read_only && !holds_database(&config.path) {
            return Err(StorageError::Missing(config.path));
        }

        let mut sled_config = sled::Config::default()
            .path(&config.path)
            .cache_capacity(config.cache_capacity);
        if config.sync_writes {
            // durability comes from explicit flushes, not the background timer
            sled_config = sled_config.flush_every_ms(None);
        }
        let db = sled_config.open()?;

        Ok(Self { db, config })
    }

    /// Open a named tree
    pub fn tree(&self, name: &str) -> StorageResult<Tree> {
        Ok(self.db.open_tree(name)?)
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    pub fn ensure_writable(&self) -> StorageResult<()> {
        if self.config.read_only {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }

    /// Monotonic id, unique across restarts
    pub fn generate_id(&self) -> StorageResult<u64> {
        self.ensure_writable()?;
        Ok(self.db.generate_id()?)
    }

    /// Make the preceding writes durable when `sync_writes` is set
    pub fn persist(&self) -> StorageResult<()> {
        if self.config.sync_writes {
            let bytes = self.db.flush()?;
            debug!("Flushed {} bytes to disk", bytes);
        }
        Ok(())
    }

    /// Unconditional flush, used at shutdown
    pub fn flush(&self) -> StorageResult<()> {
        if !self.config.read_only {
            self.db.flush()?;
        }
        Ok(())
    }
}

/// A missing or empty directory holds no database
fn holds_database(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Serialize a record for storage
pub fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StorageError::Codec(e.to_string()))
}

/// Deserialize a stored record
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> StorageResult<T> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Codec(e.to_string()))
}

/// Read a big-endian `u128` counter; absent means zero
pub fn decode_u128(key: &[u8], bytes: Option<&[u8]>) -> StorageResult<u128> {
    match bytes {
        None => Ok(0),
        Some(b) => {
            let arr: [u8; 16] = b.try_into().map_err(|_| StorageError::Corrupt {
                key: hex::encode(key),
                reason: format!("expected 16 bytes, found {}", b.len()),
            })?;
            Ok(u128::from_be_bytes(arr))
        }
    }
}
