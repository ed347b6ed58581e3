//! RocksDB-backed queue store.
//!
//! Column families:
//! - `offline_queue`: the latest queue snapshot under a single key
//! - `metadata`: when the snapshot was written and how large it is
//!
//! Snapshot and metadata are written in one atomic batch so a crash never
//! leaves metadata describing a snapshot that is not there.

use rocksdb::{
    ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Options, SingleThreaded,
    WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{QueueStore, StoreError};

const CF_QUEUE: &str = "offline_queue";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_QUEUE, CF_METADATA];

const SNAPSHOT_KEY: &[u8] = b"snapshot";
const METADATA_KEY: &[u8] = b"snapshot_meta";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// fsync every snapshot write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 64)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 4MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_revisions"),
            sync_writes: true,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (no fsync, small buffers).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            max_open_files: 16,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Seconds since epoch
    pub saved_at: u64,
    /// Snapshot size in bytes
    pub size: u64,
}

impl SnapshotMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(meta)
    }
}

/// Offline queue persisted in RocksDB.
pub struct RocksQueueStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksQueueStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                cf_opts.set_write_buffer_size(config.write_buffer_size);
                // Snapshots are already LZ4-compressed by the queue
                cf_opts.set_compression_type(DBCompressionType::None);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::debug!("Opened offline queue store at {}", config.path.display());
        Ok(Self { db, config })
    }

    /// Metadata of the stored snapshot.
    pub fn metadata(&self) -> Result<Option<SnapshotMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, METADATA_KEY)? {
            Some(bytes) => SnapshotMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }
}

impl QueueStore for RocksQueueStore {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_QUEUE)?;
        Ok(self.db.get_cf(cf, SNAPSHOT_KEY)?)
    }

    fn save(&self, snapshot: &[u8]) -> Result<(), StoreError> {
        let cf_queue = self.cf(CF_QUEUE)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let meta = SnapshotMetadata {
            saved_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            size: snapshot.len() as u64,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_queue, SNAPSHOT_KEY, snapshot);
        batch.put_cf(cf_meta, METADATA_KEY, meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let cf_queue = self.cf(CF_QUEUE)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_queue, SNAPSHOT_KEY);
        batch.delete_cf(cf_meta, METADATA_KEY);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }
}
