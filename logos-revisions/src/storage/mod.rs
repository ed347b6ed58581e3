//! Durable key-value storage for the offline queue.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   snapshot bytes   ┌──────────────────────────┐
//! │ OfflineQueue │ ─────────────────► │ QueueStore               │
//! │ (in-memory)  │ ◄───────────────── │  RocksQueueStore (disk)  │
//! └──────────────┘    on startup      │  MemoryQueueStore (RAM)  │
//!                                     └──────────────────────────┘
//! ```
//!
//! The store only sees opaque snapshot bytes; encoding, checksums and
//! compression live in [`crate::offline`].

pub mod memory;
pub mod rocks;

pub use memory::MemoryQueueStore;
pub use rocks::{RocksQueueStore, StoreConfig};

use thiserror::Error;

/// Storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Where the offline queue snapshot lives between runs.
pub trait QueueStore: Send {
    /// The last saved snapshot, if any.
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the saved snapshot.
    fn save(&self, snapshot: &[u8]) -> Result<(), StoreError>;

    fn clear(&self) -> Result<(), StoreError>;
}
