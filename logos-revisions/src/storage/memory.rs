//! In-memory queue store.
//!
//! Clones share one slot, so a test (or a host without a disk) can hand one
//! clone to the engine and inspect or reuse another.

use std::sync::{Arc, Mutex};

use super::{QueueStore, StoreError};

#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing snapshot bytes.
    pub fn with_snapshot(snapshot: Vec<u8>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(snapshot))),
        }
    }

    /// Bytes currently stored.
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }
}

impl QueueStore for MemoryQueueStore {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))?;
        Ok(slot.clone())
    }

    fn save(&self, snapshot: &[u8]) -> Result<(), StoreError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))?;
        *slot = Some(snapshot.to_vec());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))?;
        *slot = None;
        Ok(())
    }
}
