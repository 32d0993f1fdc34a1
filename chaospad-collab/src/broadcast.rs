//! Best-effort fan-out to N-1 peers with inline eviction.
//!
//! One send attempt per member other than the sender. Members whose channel is
//! already closed, or whose send fails, are collected and removed from the room
//! after the pass. Failures never reach the sender.
//!
//! The pass iterates over a membership copy taken when the call starts, so
//! joins and leaves that race with it cannot disturb the iteration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::Frame;
use crate::room::{PeerId, RoomRegistry};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_broadcast: u64,
    pub deliveries: u64,
    pub failed_sends: u64,
    pub evictions: u64,
}

/// Atomic broadcast stats so the hot path never takes a lock for accounting.
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    frames_broadcast: AtomicU64,
    deliveries: AtomicU64,
    failed_sends: AtomicU64,
    evictions: AtomicU64,
}

/// Outcome of one broadcast call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers the frame was handed to successfully.
    pub delivered: usize,
    /// Peers removed from the room during this call.
    pub evicted: Vec<PeerId>,
}

pub struct BroadcastEngine {
    rooms: Arc<RoomRegistry>,
    stats: AtomicBroadcastStats,
}

impl BroadcastEngine {
    pub fn new(rooms: Arc<RoomRegistry>) -> Self {
        Self {
            rooms,
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Deliver `frame` to every member of `document_id` except `sender`.
    pub async fn broadcast(&self, document_id: &str, sender: PeerId, frame: &Frame) -> BroadcastReport {
        if !frame.tag().is_relayed() {
            log::trace!("Dropping non-relayed frame {:?} from {sender}", frame.tag());
            return BroadcastReport::default();
        }

        let members = self.rooms.members(document_id).await;
        let mut report = BroadcastReport::default();
        let mut dead: Vec<PeerId> = Vec::new();

        for peer in members {
            let peer_id = peer.id();
            if peer_id == sender {
                continue;
            }
            if !peer.is_open() {
                dead.push(peer_id);
                continue;
            }
            match peer.send(frame.as_bytes().clone()).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    log::debug!("Send to peer {peer_id} in room {document_id} failed: {e}");
                    self.stats.failed_sends.fetch_add(1, Ordering::Relaxed);
                    dead.push(peer_id);
                }
            }
        }

        let evicted = self.rooms.evict(document_id, &dead).await;
        if !evicted.is_empty() {
            log::warn!(
                "Evicted {} unreachable peer(s) from room {document_id}",
                evicted.len()
            );
            self.stats
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        }
        report.evicted = evicted;

        self.stats.frames_broadcast.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        report
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_broadcast: self.stats.frames_broadcast.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            failed_sends: self.stats.failed_sends.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::protocol::FrameTag;
    use crate::room::test_support::RecordingPeer;
    use crate::room::{Peer, SendError};
    use async_trait::async_trait;
    use bytes::Bytes;

    async fn engine_with_peers(n: usize) -> (BroadcastEngine, Vec<Arc<RecordingPeer>>) {
        let dir = MemoryDirectory::with_documents(["pad"]);
        let rooms = Arc::new(RoomRegistry::new(Arc::new(dir), 10));
        let mut peers = Vec::new();
        for _ in 0..n {
            let peer = RecordingPeer::new();
            rooms.join("pad", peer.clone()).await.unwrap();
            peers.push(peer);
        }
        (BroadcastEngine::new(rooms), peers)
    }

    #[tokio::test]
    async fn test_fan_out_excludes_sender() {
        let (engine, peers) = engine_with_peers(3).await;
        let frame = Frame::update(&[1, 2, 3]);

        let report = engine.broadcast("pad", peers[0].id(), &frame).await;
        assert_eq!(report.delivered, 2);
        assert!(report.evicted.is_empty());

        assert!(peers[0].received().is_empty());
        assert_eq!(peers[1].received(), vec![frame.as_bytes().clone()]);
        assert_eq!(peers[2].received(), vec![frame.as_bytes().clone()]);
    }

    #[tokio::test]
    async fn test_ping_never_forwarded() {
        let (engine, peers) = engine_with_peers(4).await;
        let report = engine.broadcast("pad", peers[0].id(), &Frame::ping()).await;
        assert_eq!(report.delivered, 0);
        for peer in &peers {
            assert!(peer.received().is_empty());
        }
    }

    #[tokio::test]
    async fn test_unknown_tag_passed_through() {
        let (engine, peers) = engine_with_peers(2).await;
        let frame = Frame::new(FrameTag::Other(0x42), b"future");
        engine.broadcast("pad", peers[0].id(), &frame).await;
        let got = peers[1].received();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0][0], 0x42);
        assert_eq!(&got[0][1..], b"future");
    }

    #[tokio::test]
    async fn test_failed_send_evicts_without_aborting() {
        let (engine, peers) = engine_with_peers(4).await;
        peers[1].fail_sends();

        let frame = Frame::update(b"delta");
        let report = engine.broadcast("pad", peers[0].id(), &frame).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.evicted, vec![peers[1].id()]);
        assert_eq!(peers[2].received().len(), 1);
        assert_eq!(peers[3].received().len(), 1);

        let rooms = engine.rooms();
        assert!(!rooms.contains("pad", peers[1].id()).await);
        assert_eq!(rooms.room_size("pad").await, 3);
        assert_eq!(engine.stats().failed_sends, 1);
        assert_eq!(engine.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_closed_peer_skipped_and_evicted() {
        let (engine, peers) = engine_with_peers(3).await;
        peers[2].close();

        let report = engine.broadcast("pad", peers[0].id(), &Frame::update(b"x")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, vec![peers[2].id()]);
        assert!(peers[2].received().is_empty());
        assert!(!engine.rooms().contains("pad", peers[2].id()).await);
    }

    /// Peer whose session tears down while a send to it is in flight.
    struct DepartingPeer {
        id: PeerId,
        rooms: Arc<RoomRegistry>,
    }

    #[async_trait]
    impl Peer for DepartingPeer {
        fn id(&self) -> PeerId {
            self.id
        }

        fn is_open(&self) -> bool {
            true
        }

        async fn send(&self, _frame: Bytes) -> Result<(), SendError> {
            self.rooms.leave("pad", self.id).await;
            Err(SendError::Closed)
        }
    }

    #[tokio::test]
    async fn test_peer_that_already_left_not_reported_evicted() {
        let (engine, peers) = engine_with_peers(2).await;
        let rooms = engine.rooms().clone();
        let departing = Arc::new(DepartingPeer {
            id: PeerId::new_v4(),
            rooms: rooms.clone(),
        });
        rooms.join("pad", departing.clone()).await.unwrap();

        let report = engine.broadcast("pad", peers[0].id(), &Frame::update(b"x")).await;
        assert_eq!(report.delivered, 1);
        assert!(report.evicted.is_empty());
        assert_eq!(engine.stats().failed_sends, 1);
        assert_eq!(engine.stats().evictions, 0);
        assert!(!rooms.contains("pad", departing.id()).await);
        assert_eq!(rooms.room_size("pad").await, 2);
    }

    #[tokio::test]
    async fn test_sender_frames_arrive_in_order() {
        let (engine, peers) = engine_with_peers(2).await;
        for i in 0..10u8 {
            engine.broadcast("pad", peers[0].id(), &Frame::update(&[i])).await;
        }
        let got: Vec<u8> = peers[1].received().iter().map(|b| b[1]).collect();
        assert_eq!(got, (0..10).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_broadcast_to_missing_room() {
        let (engine, _peers) = engine_with_peers(0).await;
        let report = engine.broadcast("nope", PeerId::nil(), &Frame::update(b"x")).await;
        assert_eq!(report, BroadcastReport::default());
        assert_eq!(engine.stats().frames_broadcast, 1);
    }
}
