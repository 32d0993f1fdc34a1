//! Room registry: document id → set of connected peers.
//!
//! A room exists if and only if it has at least one member. It is created by
//! the first accepted join and removed when its last member leaves or is
//! evicted. Admission (existence check + capacity check + insert) is the only
//! way in.
//!
//! ```text
//!   join(doc, peer)
//!        │
//!        ├── directory.exists(doc)? ── no ──► RejectedNotFound
//!        │
//!        ├── room.len() >= capacity? ─ yes ─► RejectedFull
//!        │
//!        └── insert ──────────────────────► Accepted
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::directory::{DirectoryError, DocumentDirectory};

/// Identity of one connection.
pub type PeerId = Uuid;

/// Default maximum peers per document.
pub const DEFAULT_ROOM_CAPACITY: usize = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Peer channel closed")]
    Closed,
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Sending half of a peer connection, as seen by the room.
#[async_trait]
pub trait Peer: Send + Sync {
    fn id(&self) -> PeerId;

    /// False once the channel is known to be closed.
    fn is_open(&self) -> bool;

    /// One send attempt of an already-encoded frame.
    async fn send(&self, frame: Bytes) -> Result<(), SendError>;
}

/// Result of a join attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    RejectedNotFound,
    RejectedFull,
}

/// Result of removing a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeaveOutcome {
    /// The peer was a member.
    pub removed: bool,
    /// The room became empty and was dropped from the registry.
    pub room_removed: bool,
}

type Members = HashMap<PeerId, Arc<dyn Peer>>;

/// Process-wide room membership.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Members>>,
    directory: Arc<dyn DocumentDirectory>,
    capacity: usize,
}

impl RoomRegistry {
    pub fn new(directory: Arc<dyn DocumentDirectory>, capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            directory,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admit `peer` into the room for `document_id`.
    ///
    /// The capacity check and the insert happen under one write lock, so two
    /// concurrent joins cannot both take the last slot.
    pub async fn join(
        &self,
        document_id: &str,
        peer: Arc<dyn Peer>,
    ) -> Result<Admission, DirectoryError> {
        if !self.directory.exists(document_id).await? {
            log::warn!("Join rejected: document {document_id} not found");
            return Ok(Admission::RejectedNotFound);
        }

        let mut rooms = self.rooms.write().await;
        let size = rooms.get(document_id).map_or(0, |m| m.len());
        if size >= self.capacity {
            log::warn!(
                "Join rejected: room {document_id} full ({size}/{})",
                self.capacity
            );
            return Ok(Admission::RejectedFull);
        }

        let is_new_room = size == 0;
        let peer_id = peer.id();
        rooms
            .entry(document_id.to_string())
            .or_default()
            .insert(peer_id, peer);

        if is_new_room {
            log::info!("Room {document_id} created");
        }
        log::debug!("Peer {peer_id} joined room {document_id} ({}/{})", size + 1, self.capacity);
        Ok(Admission::Accepted)
    }

    /// Remove `peer_id` from the room, dropping the room if it is now empty.
    pub async fn leave(&self, document_id: &str, peer_id: PeerId) -> LeaveOutcome {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(document_id) else {
            return LeaveOutcome::default();
        };

        let removed = members.remove(&peer_id).is_some();
        let room_removed = members.is_empty();
        if room_removed {
            rooms.remove(document_id);
            log::info!("Room {document_id} removed (empty)");
        }
        LeaveOutcome {
            removed,
            room_removed,
        }
    }

    /// Remove a batch of peers (broadcast eviction). Returns the ids that were
    /// still members; peers that already left are skipped.
    pub async fn evict(&self, document_id: &str, peer_ids: &[PeerId]) -> Vec<PeerId> {
        if peer_ids.is_empty() {
            return Vec::new();
        }
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(document_id) else {
            return Vec::new();
        };

        let evicted: Vec<PeerId> = peer_ids
            .iter()
            .copied()
            .filter(|id| members.remove(id).is_some())
            .collect();
        if members.is_empty() {
            rooms.remove(document_id);
            log::info!("Room {document_id} removed (all peers evicted)");
        }
        evicted
    }

    /// Stable copy of the current membership.
    pub async fn members(&self, document_id: &str) -> Vec<Arc<dyn Peer>> {
        self.rooms
            .read()
            .await
            .get(document_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn room_size(&self, document_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(document_id)
            .map_or(0, |m| m.len())
    }

    pub async fn contains(&self, document_id: &str, peer_id: PeerId) -> bool {
        self.rooms
            .read()
            .await
            .get(document_id)
            .is_some_and(|m| m.contains_key(&peer_id))
    }

    pub async fn has_room(&self, document_id: &str) -> bool {
        self.rooms.read().await.contains_key(document_id)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
