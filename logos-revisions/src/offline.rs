//! Offline queue.
//!
//! Saves made while the transport is unavailable are parked here as full
//! document contents and replayed through the normal save pipeline once
//! connectivity returns, strictly one at a time and in FIFO order.
//!
//! Snapshot format (what the [`QueueStore`] holds):
//! ```text
//! lz4( bincode( QueueSnapshot { format, checksum, entries: bincode(Vec<Entry>) } ) )
//! ```
//! A snapshot that fails to decompress, decode or verify is discarded and
//! the queue starts empty.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::RevisionError;
use crate::revision::{DocPath, RevisionId};
use crate::storage::{QueueStore, StoreError};

const SNAPSHOT_FORMAT: u8 = 1;

/// One save created while disconnected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOfflineEntry {
    /// Local timestamp; doubles as a temporary id until the entry is replayed.
    pub created_at: u64,
    /// Id the entry's diff base ends at: the previous entry's `created_at`
    /// while queued, the id that entry resolved to once replayed.
    pub depends_on: Option<RevisionId>,
    pub path: DocPath,
    pub content: String,
    pub contributors: Vec<String>,
    pub silent: bool,
    pub restoring: Option<RevisionId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueSnapshot {
    format: u8,
    checksum: u32,
    entries: Vec<u8>,
}

/// FNV-1a over the encoded entries.
fn checksum(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn encode_snapshot(entries: &VecDeque<PendingOfflineEntry>) -> Result<Vec<u8>, StoreError> {
    let config = bincode::config::standard();
    let encoded = bincode::serde::encode_to_vec(entries, config)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let snapshot = QueueSnapshot {
        format: SNAPSHOT_FORMAT,
        checksum: checksum(&encoded),
        entries: encoded,
    };
    let bytes = bincode::serde::encode_to_vec(&snapshot, config)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

fn decode_snapshot(bytes: &[u8]) -> Result<VecDeque<PendingOfflineEntry>, StoreError> {
    let config = bincode::config::standard();
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Corrupt(format!("decompression failed: {e}")))?;
    let (snapshot, _): (QueueSnapshot, _) = bincode::serde::decode_from_slice(&raw, config)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;

    if snapshot.format != SNAPSHOT_FORMAT {
        return Err(StoreError::Corrupt(format!(
            "unknown snapshot format {}",
            snapshot.format
        )));
    }
    if checksum(&snapshot.entries) != snapshot.checksum {
        return Err(StoreError::Corrupt("checksum mismatch".into()));
    }

    let (entries, _) = bincode::serde::decode_from_slice(&snapshot.entries, config)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(entries)
}

/// Ordered, persisted queue of offline saves.
pub struct OfflineQueue {
    entries: VecDeque<PendingOfflineEntry>,
    max_size: usize,
    store: Box<dyn QueueStore>,
    recovered: Option<RevisionError>,
}

impl OfflineQueue {
    /// Load the queue from `store`. A corrupt snapshot is logged, cleared and
    /// replaced by an empty queue; startup never fails because of it.
    pub fn open(store: Box<dyn QueueStore>, max_size: usize) -> Self {
        let mut recovered = None;
        let entries = match store.load().and_then(|bytes| match bytes {
            Some(bytes) => decode_snapshot(&bytes),
            None => Ok(VecDeque::new()),
        }) {
            Ok(entries) => {
                if !entries.is_empty() {
                    log::info!("Restored {} offline revision(s)", entries.len());
                }
                entries
            }
            Err(e) => {
                log::error!("Discarding offline queue snapshot: {e}");
                if let Err(e) = store.clear() {
                    log::warn!("Failed to clear corrupt offline queue snapshot: {e}");
                }
                recovered = Some(RevisionError::PersistenceCorruption(e.to_string()));
                VecDeque::new()
            }
        };

        Self {
            entries,
            max_size,
            store,
            recovered,
        }
    }

    /// Corruption detected while opening, reported once.
    pub fn take_recovery_error(&mut self) -> Option<RevisionError> {
        self.recovered.take()
    }

    /// Append an entry and persist the queue. `depends_on` is set to the
    /// current tail. Returns false when the queue is full.
    pub fn enqueue(&mut self, mut entry: PendingOfflineEntry) -> bool {
        if self.entries.len() >= self.max_size {
            log::error!(
                "Offline queue full ({} entries), dropping save of {}",
                self.max_size,
                entry.path
            );
            return false;
        }
        entry.depends_on = self.entries.back().map(|tail| tail.created_at);
        log::debug!(
            "Queued offline save of {} ({:?} -> {})",
            entry.path,
            entry.depends_on,
            entry.created_at
        );
        self.entries.push_back(entry);
        self.persist();
        true
    }

    /// Put entries back in front of everything queued, in the given order.
    /// Entries that do not fit are returned.
    pub fn requeue_front(&mut self, entries: Vec<PendingOfflineEntry>) -> Vec<PendingOfflineEntry> {
        let room = self.max_size.saturating_sub(self.entries.len());
        let mut entries = entries;
        let rejected = if entries.len() > room {
            entries.split_off(room)
        } else {
            Vec::new()
        };
        for entry in &rejected {
            log::error!(
                "Offline queue full ({} entries), dropping save of {}",
                self.max_size,
                entry.path
            );
        }
        if entries.is_empty() {
            return rejected;
        }

        for entry in entries.into_iter().rev() {
            self.entries.push_front(entry);
        }
        if let Some(head) = self.entries.front_mut() {
            head.depends_on = None;
        }
        self.relink();
        self.persist();
        rejected
    }

    pub fn head(&self) -> Option<&PendingOfflineEntry> {
        self.entries.front()
    }

    /// Point the head at the id its predecessor resolved to.
    pub fn set_head_dependency(&mut self, id: RevisionId) {
        if let Some(head) = self.entries.front_mut() {
            if head.depends_on != Some(id) {
                head.depends_on = Some(id);
                self.persist();
            }
        }
    }

    /// Remove the head once its save has resolved.
    pub fn pop_head(&mut self) -> Option<PendingOfflineEntry> {
        let head = self.entries.pop_front();
        if head.is_some() {
            self.persist();
        }
        head
    }

    /// Drop every entry for `path` (and, for folders, everything inside it).
    pub fn remove_path(&mut self, path: &DocPath) -> usize {
        let before = self.entries.len();
        let old_head = self.entries.front().map(|e| e.created_at);
        self.entries
            .retain(|e| &e.path != path && !e.path.is_within(path));
        let removed = before - self.entries.len();
        if removed > 0 {
            if let Some(head) = self.entries.front_mut() {
                // A new head has nothing queued before it.
                if Some(head.created_at) != old_head {
                    head.depends_on = None;
                }
            }
            self.relink();
            self.persist();
        }
        removed
    }

    /// Re-key entries after a document or folder was renamed.
    pub fn rename_path(&mut self, from: &DocPath, to: &DocPath) -> usize {
        let mut renamed = 0;
        for entry in self.entries.iter_mut() {
            if &entry.path == from {
                entry.path = to.clone();
                renamed += 1;
            } else if entry.path.is_within(from) {
                let rest = &entry.path.as_str()[from.as_str().len()..];
                entry.path = DocPath::new(format!("{}{rest}", to.as_str()));
                renamed += 1;
            }
        }
        if renamed > 0 {
            self.persist();
        }
        renamed
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingOfflineEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the current queue to the store.
    pub fn flush(&self) -> Result<(), StoreError> {
        if self.entries.is_empty() {
            return self.store.clear();
        }
        let bytes = encode_snapshot(&self.entries)?;
        self.store.save(&bytes)
    }

    fn persist(&self) {
        if let Err(e) = self.flush() {
            log::warn!("Failed to persist offline queue: {e}");
        }
    }

    /// Restore the chain after entries were removed from the middle.
    fn relink(&mut self) {
        let mut previous: Option<u64> = None;
        for entry in self.entries.iter_mut() {
            if let Some(prev) = previous {
                entry.depends_on = Some(prev);
            }
            previous = Some(entry.created_at);
        }
    }
}

impl Drop for OfflineQueue {
    fn drop(&mut self) {
        self.persist();
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("entries", &self.entries)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryQueueStore;

    fn entry(created_at: u64, path: &str, content: &str) -> PendingOfflineEntry {
        PendingOfflineEntry {
            created_at,
            depends_on: None,
            path: DocPath::new(path),
            content: content.to_string(),
            contributors: vec!["alice@example.com".into()],
            silent: false,
            restoring: None,
        }
    }

    #[test]
    fn test_enqueue_links_dependencies() {
        let mut queue = OfflineQueue::open(Box::new(MemoryQueueStore::new()), 16);
        assert!(queue.enqueue(entry(100, "a.txt", "one")));
        assert!(queue.enqueue(entry(200, "a.txt", "two")));
        assert!(queue.enqueue(entry(300, "b.txt", "three")));

        let deps: Vec<_> = queue.iter().map(|e| e.depends_on).collect();
        assert_eq!(deps, vec![None, Some(100), Some(200)]);
    }

    #[test]
    fn test_enqueue_persists_every_time() {
        let store = MemoryQueueStore::new();
        let mut queue = OfflineQueue::open(Box::new(store.clone()), 16);
        queue.enqueue(entry(1, "a.txt", "x"));
        let first = store.snapshot().unwrap();
        queue.enqueue(entry(2, "a.txt", "y"));
        assert_ne!(store.snapshot().unwrap(), first);
    }

    #[test]
    fn test_reopen_preserves_order() {
        let store = MemoryQueueStore::new();
        {
            let mut queue = OfflineQueue::open(Box::new(store.clone()), 16);
            for i in 0..5 {
                queue.enqueue(entry(i * 10, "a.txt", &format!("v{i}")));
            }
        }

        let queue = OfflineQueue::open(Box::new(store), 16);
        let contents: Vec<_> = queue.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["v0", "v1", "v2", "v3", "v4"]);
    }

    #[test]
    fn test_corrupt_snapshot_resets() {
        let store = MemoryQueueStore::with_snapshot(vec![1, 2, 3, 4, 5]);
        let mut queue = OfflineQueue::open(Box::new(store.clone()), 16);

        assert!(queue.is_empty());
        assert!(matches!(
            queue.take_recovery_error(),
            Some(RevisionError::PersistenceCorruption(_))
        ));
        assert!(queue.take_recovery_error().is_none());
        assert_eq!(store.snapshot(), None);
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let mut entries = VecDeque::new();
        entries.push_back(entry(1, "a.txt", "x"));
        let encoded = bincode::serde::encode_to_vec(&entries, bincode::config::standard()).unwrap();
        let snapshot = QueueSnapshot {
            format: SNAPSHOT_FORMAT,
            checksum: checksum(&encoded) ^ 1,
            entries: encoded,
        };
        let bytes = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard()).unwrap();
        let compressed = lz4_flex::compress_prepend_size(&bytes);

        assert!(matches!(
            decode_snapshot(&compressed),
            Err(StoreError::Corrupt(msg)) if msg.contains("checksum")
        ));
    }

    #[test]
    fn test_full_queue_rejects() {
        let mut queue = OfflineQueue::open(Box::new(MemoryQueueStore::new()), 2);
        assert!(queue.enqueue(entry(1, "a.txt", "x")));
        assert!(queue.enqueue(entry(2, "a.txt", "y")));
        assert!(!queue.enqueue(entry(3, "a.txt", "z")));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_head_dependency_and_pop() {
        let mut queue = OfflineQueue::open(Box::new(MemoryQueueStore::new()), 16);
        queue.enqueue(entry(100, "a.txt", "one"));
        queue.enqueue(entry(200, "a.txt", "two"));

        assert_eq!(queue.pop_head().map(|e| e.created_at), Some(100));
        queue.set_head_dependency(900);
        assert_eq!(queue.head().and_then(|e| e.depends_on), Some(900));
    }

    #[test]
    fn test_remove_path_relinks() {
        let mut queue = OfflineQueue::open(Box::new(MemoryQueueStore::new()), 16);
        queue.enqueue(entry(1, "a.txt", "x"));
        queue.enqueue(entry(2, "dir/b.txt", "y"));
        queue.enqueue(entry(3, "c.txt", "z"));

        assert_eq!(queue.remove_path(&DocPath::new("dir")), 1);
        let deps: Vec<_> = queue.iter().map(|e| (e.created_at, e.depends_on)).collect();
        assert_eq!(deps, vec![(1, None), (3, Some(1))]);
    }

    #[test]
    fn test_removing_head_clears_new_head_dependency() {
        let store = MemoryQueueStore::new();
        let mut queue = OfflineQueue::open(Box::new(store.clone()), 16);
        queue.enqueue(entry(1, "a.txt", "x"));
        queue.enqueue(entry(2, "b.txt", "y"));
        queue.enqueue(entry(3, "b.txt", "z"));

        assert_eq!(queue.remove_path(&DocPath::new("a.txt")), 1);
        let deps: Vec<_> = queue.iter().map(|e| (e.created_at, e.depends_on)).collect();
        assert_eq!(deps, vec![(2, None), (3, Some(2))]);

        drop(queue);
        let reopened = OfflineQueue::open(Box::new(store), 16);
        assert_eq!(reopened.head().map(|e| e.depends_on), Some(None));
    }

    #[test]
    fn test_remove_path_keeps_resolved_head_dependency() {
        let mut queue = OfflineQueue::open(Box::new(MemoryQueueStore::new()), 16);
        queue.enqueue(entry(1, "a.txt", "x"));
        queue.enqueue(entry(2, "b.txt", "y"));
        queue.set_head_dependency(900);

        queue.remove_path(&DocPath::new("b.txt"));
        assert_eq!(queue.head().and_then(|e| e.depends_on), Some(900));
    }

    #[test]
    fn test_requeue_front_goes_before_queued_entries() {
        let mut queue = OfflineQueue::open(Box::new(MemoryQueueStore::new()), 3);
        queue.enqueue(entry(10, "a.txt", "queued"));

        let rejected = queue.requeue_front(vec![
            entry(1, "a.txt", "first"),
            entry(2, "b.txt", "second"),
            entry(3, "b.txt", "third"),
        ]);
        assert_eq!(rejected.iter().map(|e| e.created_at).collect::<Vec<_>>(), vec![3]);

        let order: Vec<_> = queue.iter().map(|e| (e.created_at, e.depends_on)).collect();
        assert_eq!(order, vec![(1, None), (2, Some(1)), (10, Some(2))]);
    }

    #[test]
    fn test_rename_path_and_folder() {
        let mut queue = OfflineQueue::open(Box::new(MemoryQueueStore::new()), 16);
        queue.enqueue(entry(1, "old.txt", "x"));
        queue.enqueue(entry(2, "src/a.rs", "y"));

        queue.rename_path(&DocPath::new("old.txt"), &DocPath::new("new.txt"));
        queue.rename_path(&DocPath::new("src"), &DocPath::new("lib"));

        let paths: Vec<_> = queue.iter().map(|e| e.path.as_str().to_string()).collect();
        assert_eq!(paths, vec!["new.txt", "lib/a.rs"]);
    }

    #[test]
    fn test_drop_flushes() {
        let store = MemoryQueueStore::new();
        let mut queue = OfflineQueue::open(Box::new(store.clone()), 16);
        queue.enqueue(entry(1, "a.txt", "x"));
        store.clear().unwrap();

        drop(queue);
        assert!(store.snapshot().is_some());
    }
}
