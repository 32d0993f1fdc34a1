//! Per-connection session over a WebSocket.
//!
//! ```text
//!   PendingValidation ──► RejectedNotFound   (close 1008 "document not found")
//!          │         └──► RejectedFull       (close 1008 "room full")
//!          ▼
//!         Open ──► Closed                    (leave room; drop room if empty)
//! ```
//!
//! The document id comes from the request path (`/ws/{document_id}`) and is
//! captured during the HTTP upgrade. A path without an id is refused there
//! with HTTP 400; existence and capacity are decided after the upgrade so the
//! client sees a proper close frame with a reason.

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::BroadcastEngine;
use crate::directory::DirectoryError;
use crate::protocol::{document_id_from_path, CloseReason, Frame, FrameTag};
use crate::room::{Admission, Peer, PeerId, SendError};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    PendingValidation,
    RejectedNotFound,
    RejectedFull,
    Open,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::RejectedNotFound | SessionState::RejectedFull | SessionState::Closed
        )
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("Upgrade request carried no document id")]
    MissingDocument,
}

/// Connection counters shared by all sessions.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub rejected_not_found: AtomicU64,
    pub rejected_full: AtomicU64,
    pub frames_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub pings: AtomicU64,
}

/// Sending half of an admitted WebSocket.
pub struct WsPeer {
    id: PeerId,
    sink: Mutex<WsSink>,
    open: AtomicBool,
}

impl WsPeer {
    fn new(id: PeerId, sink: WsSink) -> Self {
        Self {
            id,
            sink: Mutex::new(sink),
            open: AtomicBool::new(true),
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    async fn close_with(&self, code: CloseCode, reason: &'static str) {
        self.mark_closed();
        let frame = CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        };
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            log::debug!("Close frame to {} not delivered: {e}", self.id);
        }
    }
}

#[async_trait::async_trait]
impl Peer for WsPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: Bytes) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(frame)).await.map_err(|e| {
            self.mark_closed();
            SendError::Transport(e.to_string())
        })
    }
}

/// One connection from upgrade to close.
pub struct Session {
    peer_id: PeerId,
    addr: SocketAddr,
    state: SessionState,
    engine: Arc<BroadcastEngine>,
    counters: Arc<ConnectionCounters>,
}

impl Session {
    pub fn new(addr: SocketAddr, engine: Arc<BroadcastEngine>, counters: Arc<ConnectionCounters>) -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            addr,
            state: SessionState::PendingValidation,
            engine,
            counters,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        log::trace!("Session {} {:?} -> {:?}", self.peer_id, self.state, next);
        self.state = next;
    }

    /// Drive the connection to a terminal state.
    pub async fn run(mut self, stream: TcpStream) -> Result<SessionState, SessionError> {
        let mut requested: Option<String> = None;
        let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            match document_id_from_path(req.uri().path()) {
                Some(id) => {
                    requested = Some(id.to_string());
                    Ok(resp)
                }
                None => {
                    let mut err = ErrorResponse::new(Some("expected /ws/{document_id}".to_string()));
                    *err.status_mut() = StatusCode::BAD_REQUEST;
                    Err(err)
                }
            }
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, capture).await?;
        let document_id = requested.ok_or(SessionError::MissingDocument)?;
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);

        let (sink, mut inbound) = ws.split();
        let peer = Arc::new(WsPeer::new(self.peer_id, sink));

        match self.engine.rooms().join(&document_id, peer.clone()).await {
            Ok(Admission::Accepted) => self.transition(SessionState::Open),
            Ok(Admission::RejectedNotFound) => {
                self.counters.rejected_not_found.fetch_add(1, Ordering::Relaxed);
                self.reject(&peer, CloseReason::DocumentNotFound).await;
                self.transition(SessionState::RejectedNotFound);
                return Ok(self.state);
            }
            Ok(Admission::RejectedFull) => {
                self.counters.rejected_full.fetch_add(1, Ordering::Relaxed);
                self.reject(&peer, CloseReason::RoomFull).await;
                self.transition(SessionState::RejectedFull);
                return Ok(self.state);
            }
            Err(e) => {
                log::error!("Directory lookup for {document_id} failed: {e}");
                peer.close_with(CloseCode::Error, "directory unavailable").await;
                self.transition(SessionState::Closed);
                return Err(e.into());
            }
        }

        log::info!("Peer {} from {} joined {document_id}", self.peer_id, self.addr);
        self.counters.active_connections.fetch_add(1, Ordering::Relaxed);

        while let Some(msg) = inbound.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    self.counters
                        .bytes_received
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    let Some(frame) = Frame::decode(data) else {
                        continue;
                    };
                    self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                    if frame.tag() == FrameTag::Ping {
                        self.counters.pings.fetch_add(1, Ordering::Relaxed);
                        log::trace!("Keepalive from {}", self.peer_id);
                        continue;
                    }
                    self.engine.broadcast(&document_id, self.peer_id, &frame).await;
                }
                Ok(Message::Close(_)) => break,
                // Text is not part of the protocol; control frames are answered by the transport
                Ok(_) => {}
                Err(e) => {
                    log::debug!("Receive error from {}: {e}", self.peer_id);
                    break;
                }
            }
        }

        peer.mark_closed();
        self.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        let outcome = self.engine.rooms().leave(&document_id, self.peer_id).await;
        self.transition(SessionState::Closed);
        log::info!(
            "Peer {} left {document_id}{}",
            self.peer_id,
            if outcome.room_removed { " (room closed)" } else { "" }
        );
        Ok(self.state)
    }

    async fn reject(&self, peer: &WsPeer, reason: CloseReason) {
        log::info!("Connection {} from {} rejected: {}", self.peer_id, self.addr, reason.reason());
        peer.close_with(CloseCode::from(reason.code()), reason.reason()).await;
    }
}
