//! In-process snapshot store, used when no storage path is configured.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{now_millis, SnapshotId, SnapshotRecord, SnapshotStore, StoreError};

#[derive(Debug)]
struct Entry {
    record: SnapshotRecord,
    blob: Vec<u8>,
}

#[derive(Debug, Default)]
struct Inner {
    next_sequence: u64,
    documents: HashMap<String, Vec<Entry>>,
}

/// Snapshots held in memory, lost on restart.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    inner: Mutex<Inner>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn append(&self, document_id: &str, blob: &[u8]) -> Result<SnapshotId, StoreError> {
        let mut inner = self.lock()?;
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        let id = SnapshotId::new();
        let record = SnapshotRecord {
            id,
            document_id: document_id.to_string(),
            sequence,
            created_at_ms: now_millis(),
            size: blob.len() as u64,
        };
        inner
            .documents
            .entry(document_id.to_string())
            .or_default()
            .push(Entry {
                record,
                blob: blob.to_vec(),
            });
        Ok(id)
    }

    fn latest(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .documents
            .get(document_id)
            .and_then(|entries| entries.last())
            .map(|e| e.blob.clone()))
    }

    fn prune(&self, document_id: &str, keep: usize) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        let Some(entries) = inner.documents.get_mut(document_id) else {
            return Ok(0);
        };
        let excess = entries.len().saturating_sub(keep);
        entries.drain(..excess);
        Ok(excess)
    }

    fn list(&self, document_id: &str) -> Result<Vec<SnapshotRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .documents
            .get(document_id)
            .map(|entries| entries.iter().map(|e| e.record.clone()).collect())
            .unwrap_or_default())
    }

    fn purge(&self, document_id: &str) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        Ok(inner
            .documents
            .remove(document_id)
            .map_or(0, |entries| entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_absent() {
        let store = MemorySnapshotStore::new();
        assert!(store.latest("pad").unwrap().is_none());
        assert_eq!(store.count("pad").unwrap(), 0);
    }

    #[test]
    fn test_latest_reflects_last_append() {
        let store = MemorySnapshotStore::new();
        store.append("pad", b"one").unwrap();
        store.append("pad", b"two").unwrap();
        assert_eq!(store.latest("pad").unwrap().unwrap(), b"two");
    }

    #[test]
    fn test_prune_removes_oldest() {
        let store = MemorySnapshotStore::new();
        for i in 0..5u8 {
            store.append("pad", &[i]).unwrap();
        }
        assert_eq!(store.prune("pad", 2).unwrap(), 3);

        let records = store.list("pad").unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].sequence < records[1].sequence);
        assert_eq!(store.latest("pad").unwrap().unwrap(), vec![4]);
    }

    #[test]
    fn test_prune_under_limit_is_noop() {
        let store = MemorySnapshotStore::new();
        store.append("pad", b"a").unwrap();
        assert_eq!(store.prune("pad", 20).unwrap(), 0);
        assert_eq!(store.prune("other", 20).unwrap(), 0);
    }

    #[test]
    fn test_purge_isolated_per_document() {
        let store = MemorySnapshotStore::new();
        store.append("a", b"1").unwrap();
        store.append("a", b"2").unwrap();
        store.append("b", b"3").unwrap();

        assert_eq!(store.purge("a").unwrap(), 2);
        assert!(store.latest("a").unwrap().is_none());
        assert_eq!(store.latest("b").unwrap().unwrap(), b"3");
    }
}
