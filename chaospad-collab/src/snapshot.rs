//! Snapshot read/write service.
//!
//! A write goes through, in order:
//! 1. document existence check (`NotFound`)
//! 2. body check: aborted or empty body is a soft failure (`ok: false`),
//!    a body over the transport limit is `BodyTooLarge`
//! 3. declared-size guard (`PayloadTooLarge`)
//! 4. per-document lock
//! 5. rate gate (`RateLimited` unless final)
//! 6. append, then prune to the retention limit
//!
//! Steps 5 and 6 run under the lock from step 4, so two concurrent writers to
//! one document can never both pass the gate inside the same interval.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::RelayConfig;
use crate::directory::DocumentDirectory;
use crate::error::SnapshotError;
use crate::gate::{DocumentLocks, GateDecision, SizeCheck, SizeGuard, SizeHint, WriteGate};
use crate::storage::{SnapshotId, SnapshotStore, StoreError};

/// Body of a submission as far as the transport delivered it.
#[derive(Debug, Clone)]
pub enum SubmissionBody {
    Received(Bytes),
    /// The client went away before the body was fully read.
    Aborted,
    /// The body grew past `limit` bytes and was not buffered further.
    TooLarge { limit: usize },
}

/// One snapshot write request.
#[derive(Debug, Clone)]
pub struct Submission {
    pub body: SubmissionBody,
    pub is_final: bool,
    pub size_hint: SizeHint,
}

impl Submission {
    pub fn new(blob: impl Into<Bytes>) -> Self {
        Self {
            body: SubmissionBody::Received(blob.into()),
            is_final: false,
            size_hint: SizeHint::default(),
        }
    }

    pub fn aborted() -> Self {
        Self {
            body: SubmissionBody::Aborted,
            is_final: false,
            size_hint: SizeHint::default(),
        }
    }

    pub fn final_write(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn with_size_hint(mut self, hint: SizeHint) -> Self {
        self.size_hint = hint;
        self
    }
}

/// Structured write result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub ok: bool,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub rate_limited: bool,
}

impl WriteOutcome {
    fn soft_fail(is_final: bool) -> Self {
        Self {
            ok: false,
            is_final,
            rate_limited: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub written: u64,
    pub rate_limited: u64,
    pub final_bypasses: u64,
    pub too_large: u64,
    pub soft_failures: u64,
}

#[derive(Debug, Default)]
struct AtomicSnapshotStats {
    written: AtomicU64,
    rate_limited: AtomicU64,
    final_bypasses: AtomicU64,
    too_large: AtomicU64,
    soft_failures: AtomicU64,
}

pub struct SnapshotService {
    directory: Arc<dyn DocumentDirectory>,
    store: Arc<dyn SnapshotStore>,
    gate: WriteGate,
    locks: DocumentLocks,
    guard: SizeGuard,
    retention: usize,
    stats: AtomicSnapshotStats,
}

impl SnapshotService {
    pub fn new(
        config: &RelayConfig,
        directory: Arc<dyn DocumentDirectory>,
        store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            directory,
            store,
            gate: WriteGate::new(config.snapshot_min_interval, clock),
            locks: DocumentLocks::new(),
            guard: SizeGuard::new(config.max_snapshot_chars, config.chars_per_word),
            retention: config.snapshot_retention,
            stats: AtomicSnapshotStats::default(),
        }
    }

    pub fn gate(&self) -> &WriteGate {
        &self.gate
    }

    pub fn locks(&self) -> &DocumentLocks {
        &self.locks
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    async fn ensure_exists(&self, document_id: &str) -> Result<(), SnapshotError> {
        if self.directory.exists(document_id).await? {
            Ok(())
        } else {
            Err(SnapshotError::NotFound(document_id.to_string()))
        }
    }

    /// Latest snapshot blob of an existing document.
    pub async fn latest(&self, document_id: &str) -> Result<Option<Vec<u8>>, SnapshotError> {
        self.ensure_exists(document_id).await?;
        let store = self.store.clone();
        let doc = document_id.to_string();
        let blob = tokio::task::spawn_blocking(move || store.latest(&doc))
            .await
            .map_err(|e| SnapshotError::Internal(e.to_string()))??;
        Ok(blob)
    }

    /// Run a submission through guard, gate and store.
    pub async fn submit(
        &self,
        document_id: &str,
        submission: Submission,
    ) -> Result<WriteOutcome, SnapshotError> {
        self.ensure_exists(document_id).await?;

        let is_final = submission.is_final;
        let blob = match submission.body {
            SubmissionBody::Received(blob) if !blob.is_empty() => blob,
            SubmissionBody::Received(_) => {
                log::debug!("Empty snapshot body for {document_id}");
                self.stats.soft_failures.fetch_add(1, Ordering::Relaxed);
                return Ok(WriteOutcome::soft_fail(is_final));
            }
            SubmissionBody::Aborted => {
                log::debug!("Snapshot upload for {document_id} aborted by client");
                self.stats.soft_failures.fetch_add(1, Ordering::Relaxed);
                return Ok(WriteOutcome::soft_fail(is_final));
            }
            SubmissionBody::TooLarge { limit } => {
                log::warn!("Snapshot body for {document_id} exceeds {limit} bytes");
                self.stats.too_large.fetch_add(1, Ordering::Relaxed);
                return Err(SnapshotError::BodyTooLarge { max_bytes: limit });
            }
        };

        if let SizeCheck::TooLarge { estimated } = self.guard.check(&submission.size_hint) {
            log::warn!(
                "Snapshot for {document_id} rejected: ~{estimated} chars over cap {}",
                self.guard.max_chars()
            );
            self.stats.too_large.fetch_add(1, Ordering::Relaxed);
            return Err(SnapshotError::PayloadTooLarge {
                max_chars: self.guard.max_chars(),
            });
        }

        let lock = self.locks.lock_for(document_id);
        let _held = lock.lock().await;

        let rate_limited = match self.gate.admit_write(document_id, is_final) {
            GateDecision::Rejected => {
                log::warn!("Snapshot for {document_id} rate limited");
                self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
                return Err(SnapshotError::RateLimited {
                    interval_secs: self.gate.min_interval().as_secs(),
                });
            }
            GateDecision::Admitted { rate_limited } => rate_limited,
        };

        let (id, pruned) = self.persist(document_id, blob).await?;
        log::debug!(
            "Stored snapshot {id} for {document_id} (final={is_final}, rate_limited={rate_limited}, pruned {pruned})"
        );

        self.stats.written.fetch_add(1, Ordering::Relaxed);
        if rate_limited {
            self.stats.final_bypasses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(WriteOutcome {
            ok: true,
            is_final,
            rate_limited,
        })
    }

    async fn persist(&self, document_id: &str, blob: Bytes) -> Result<(SnapshotId, usize), SnapshotError> {
        let store = self.store.clone();
        let doc = document_id.to_string();
        let retention = self.retention;
        let result = tokio::task::spawn_blocking(move || -> Result<(SnapshotId, usize), StoreError> {
            let id = store.append(&doc, &blob)?;
            let pruned = store.prune(&doc, retention)?;
            Ok((id, pruned))
        })
        .await
        .map_err(|e| SnapshotError::Internal(e.to_string()))?;
        Ok(result?)
    }

    pub fn stats(&self) -> SnapshotStats {
        SnapshotStats {
            written: self.stats.written.load(Ordering::Relaxed),
            rate_limited: self.stats.rate_limited.load(Ordering::Relaxed),
            final_bypasses: self.stats.final_bypasses.load(Ordering::Relaxed),
            too_large: self.stats.too_large.load(Ordering::Relaxed),
            soft_failures: self.stats.soft_failures.load(Ordering::Relaxed),
        }
    }
}
