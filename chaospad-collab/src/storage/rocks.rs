//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `documents` — registered document ids (bincode `DocumentRecord`)
//! - `snapshots` — snapshot blobs (LZ4 compressed), keyed by document + sequence
//! - `meta`      — store-wide counters (next snapshot sequence)
//!
//! Snapshot key layout:
//! ```text
//! ┌─────────────┬──────────────────┬──────────────┐
//! │ id_len u16  │ document id      │ sequence u64 │
//! │ big-endian  │ utf-8 bytes      │ big-endian   │
//! └─────────────┴──────────────────┴──────────────┘
//! ```
//! The length prefix makes each document's keys a contiguous range with no
//! id being a prefix of another, and big-endian sequences sort in creation
//! order, so a forward scan is oldest → newest.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{now_millis, SnapshotId, SnapshotRecord, SnapshotStore, StoreError};
use crate::directory::{DirectoryError, DocumentDirectory};

const CF_DOCUMENTS: &str = "documents";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_SNAPSHOTS, CF_META];

const META_NEXT_SEQUENCE: &[u8] = b"next_sequence";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("chaospad_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// A registered document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub created_at_ms: u64,
}

/// Value stored under a snapshot key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    id: SnapshotId,
    created_at_ms: u64,
    size: u64,
    compressed: Vec<u8>,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Durable snapshot store and document registry.
pub struct RocksSnapshotStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next sequence number; held while an append is written so the persisted
    /// counter never moves backwards.
    next_sequence: Mutex<u64>,
}

impl RocksSnapshotStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let next_sequence = Self::recover_sequence(&db)?;
        log::info!(
            "Opened snapshot store at {} (next sequence {next_sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            next_sequence: Mutex::new(next_sequence),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            CF_SNAPSHOTS => {
                // Values are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_DOCUMENTS | CF_META => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_META}' not found")))?;
        match db.get_cf(cf, META_NEXT_SEQUENCE)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(u64::from_be_bytes(buf))
            }
            Some(_) => Err(StoreError::Deserialization("Corrupt sequence counter".into())),
            None => Ok(0),
        }
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Register a document id. Returns false if it was already registered.
    pub fn register_document(&self, document_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        if self.db.get_cf(cf, document_id.as_bytes())?.is_some() {
            return Ok(false);
        }
        let record = DocumentRecord {
            document_id: document_id.to_string(),
            created_at_ms: now_millis(),
        };
        self.db
            .put_cf_opt(cf, document_id.as_bytes(), encode(&record)?, &self.write_options())?;
        Ok(true)
    }

    pub fn document_exists(&self, document_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        Ok(self.db.get_cf(cf, document_id.as_bytes())?.is_some())
    }

    pub fn load_document(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        self.db
            .get_cf(cf, document_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Remove the document record and cascade to its snapshots.
    pub fn delete_document(&self, document_id: &str) -> Result<usize, StoreError> {
        let removed = self.purge(document_id)?;
        let cf = self.cf(CF_DOCUMENTS)?;
        self.db
            .delete_cf_opt(cf, document_id.as_bytes(), &self.write_options())?;
        log::info!("Deleted document {document_id} ({removed} snapshots)");
        Ok(removed)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn key_prefix(document_id: &str) -> Result<Vec<u8>, StoreError> {
        let id = document_id.as_bytes();
        let len = u16::try_from(id.len())
            .map_err(|_| StoreError::Serialization("Document id too long".into()))?;
        let mut key = Vec::with_capacity(2 + id.len() + 8);
        key.extend_from_slice(&len.to_be_bytes());
        key.extend_from_slice(id);
        Ok(key)
    }

    fn snapshot_key(prefix: &[u8], sequence: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + 8);
        key.extend_from_slice(prefix);
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    fn sequence_of(key: &[u8]) -> Result<u64, StoreError> {
        if key.len() < 8 {
            return Err(StoreError::Deserialization("Snapshot key too short".into()));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[key.len() - 8..]);
        Ok(u64::from_be_bytes(buf))
    }

    /// Keys of a document's snapshots, oldest first.
    fn snapshot_keys(&self, document_id: &str) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let prefix = Self::key_prefix(document_id)?;
        let mut keys = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }
}

impl SnapshotStore for RocksSnapshotStore {
    fn append(&self, document_id: &str, blob: &[u8]) -> Result<SnapshotId, StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_META)?;
        let prefix = Self::key_prefix(document_id)?;

        let id = SnapshotId::new();
        let value = encode(&StoredSnapshot {
            id,
            created_at_ms: now_millis(),
            size: blob.len() as u64,
            compressed: lz4_flex::compress_prepend_size(blob),
        })?;

        let mut next = self.next_sequence.lock().map_err(|_| StoreError::Poisoned)?;
        let sequence = *next;

        // Atomic batch: snapshot + advanced counter
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, Self::snapshot_key(&prefix, sequence), &value);
        batch.put_cf(cf_meta, META_NEXT_SEQUENCE, (sequence + 1).to_be_bytes());
        self.db.write_opt(batch, &self.write_options())?;

        *next = sequence + 1;
        Ok(id)
    }

    fn latest(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let prefix = Self::key_prefix(document_id)?;
        let upper = Self::snapshot_key(&prefix, u64::MAX);

        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&upper, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                if !key.starts_with(&prefix) {
                    return Ok(None);
                }
                let stored: StoredSnapshot = decode(&value)?;
                lz4_flex::decompress_size_prepended(&stored.compressed)
                    .map(Some)
                    .map_err(|e| StoreError::Compression(e.to_string()))
            }
            None => Ok(None),
        }
    }

    fn prune(&self, document_id: &str, keep: usize) -> Result<usize, StoreError> {
        let keys = self.snapshot_keys(document_id)?;
        let excess = keys.len().saturating_sub(keep);
        if excess == 0 {
            return Ok(0);
        }

        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut batch = WriteBatch::default();
        for key in &keys[..excess] {
            batch.delete_cf(cf, key);
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(excess)
    }

    fn list(&self, document_id: &str) -> Result<Vec<SnapshotRecord>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let prefix = Self::key_prefix(document_id)?;
        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let stored: StoredSnapshot = decode(&value)?;
            records.push(SnapshotRecord {
                id: stored.id,
                document_id: document_id.to_string(),
                sequence: Self::sequence_of(&key)?,
                created_at_ms: stored.created_at_ms,
                size: stored.size,
            });
        }
        Ok(records)
    }

    fn count(&self, document_id: &str) -> Result<usize, StoreError> {
        Ok(self.snapshot_keys(document_id)?.len())
    }

    fn purge(&self, document_id: &str) -> Result<usize, StoreError> {
        self.prune(document_id, 0)
    }
}

/// Document directory over the `documents` column family. Lookups run on the
/// blocking pool like every other RocksDB call.
#[derive(Clone)]
pub struct RocksDirectory {
    store: Arc<RocksSnapshotStore>,
}

impl RocksDirectory {
    pub fn new(store: Arc<RocksSnapshotStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DocumentDirectory for RocksDirectory {
    async fn exists(&self, document_id: &str) -> Result<bool, DirectoryError> {
        let store = self.store.clone();
        let doc = document_id.to_string();
        tokio::task::spawn_blocking(move || store.document_exists(&doc))
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))
    }
}
