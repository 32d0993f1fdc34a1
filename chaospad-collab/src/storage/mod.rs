//! Append-only snapshot persistence with bounded retention.
//!
//! Architecture:
//! ```text
//! ┌───────────────┐   append/prune   ┌────────────────────────────────┐
//! │SnapshotService│ ───────────────► │ SnapshotStore                  │
//! │ (gate + lock) │                  │  ├── MemorySnapshotStore       │
//! └───────────────┘ ◄─────────────── │  └── RocksSnapshotStore        │
//!                        latest      │       CF "documents" — records │
//!                                    │       CF "snapshots" — LZ4 blobs│
//!                                    │       CF "meta"      — seq no. │
//!                                    └────────────────────────────────┘
//! ```
//!
//! Snapshots are immutable. "Current state" of a document is its most
//! recently appended snapshot; ordering is by a store-wide sequence number so
//! that two appends in the same millisecond still have a defined order.

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemorySnapshotStore;
pub use rocks::{RocksDirectory, RocksSnapshotStore, StoreConfig};

/// Snapshots kept per document after each append.
pub const DEFAULT_RETENTION: usize = 20;

/// Identifier assigned to a snapshot at append time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub Uuid);

impl SnapshotId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Metadata of one stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: SnapshotId,
    pub document_id: String,
    /// Store-wide creation order.
    pub sequence: u64,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    /// Uncompressed blob size in bytes.
    pub size: u64,
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Store lock poisoned")]
    Poisoned,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable per-document snapshot log.
///
/// Implementations are synchronous; callers serialize writes per document.
pub trait SnapshotStore: Send + Sync {
    /// Persist a new snapshot. Fails only on storage failure.
    fn append(&self, document_id: &str, blob: &[u8]) -> Result<SnapshotId, StoreError>;

    /// Blob of the most recently appended snapshot, if any.
    fn latest(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete all but the `keep` newest snapshots. Returns how many were removed.
    fn prune(&self, document_id: &str, keep: usize) -> Result<usize, StoreError>;

    /// Snapshot metadata, oldest first.
    fn list(&self, document_id: &str) -> Result<Vec<SnapshotRecord>, StoreError>;

    fn count(&self, document_id: &str) -> Result<usize, StoreError> {
        Ok(self.list(document_id)?.len())
    }

    /// Delete every snapshot of a document (cascading document deletion).
    fn purge(&self, document_id: &str) -> Result<usize, StoreError>;
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
