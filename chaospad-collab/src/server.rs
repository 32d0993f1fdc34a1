//! Relay server: WebSocket rooms plus the HTTP snapshot API.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://…/ws/{doc}                          ┌── Client B
//!             ├──► Session ──► RoomRegistry ──► BroadcastEngine ──┤
//! Client C ──┘        │             │                             └── Client C
//!                     │             └── DocumentDirectory
//!                     │
//! HTTP /api/v1/snapshot/{doc} ──► SnapshotService ──► SnapshotStore
//!                                   (guard, lock, gate)   ├── memory
//!                                                         └── RocksDB (LZ4)
//! ```
//!
//! With a storage path configured the RocksDB store doubles as the document
//! directory; otherwise both live in memory and the documents listed in the
//! configuration are the only ones that exist.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::broadcast::{BroadcastEngine, BroadcastStats};
use crate::clock::{Clock, SystemClock};
use crate::config::RelayConfig;
use crate::directory::{DocumentDirectory, MemoryDirectory};
use crate::room::RoomRegistry;
use crate::session::{ConnectionCounters, Session};
use crate::snapshot::{SnapshotService, SnapshotStats};
use crate::storage::{MemorySnapshotStore, RocksDirectory, RocksSnapshotStore, SnapshotStore, StoreConfig, StoreError};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_not_found: u64,
    pub rejected_full: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub pings: u64,
    pub active_rooms: usize,
    pub broadcast: BroadcastStats,
    pub snapshots: SnapshotStats,
}

/// Both listeners, bound but not yet serving.
pub struct Listeners {
    ws: TcpListener,
    http: TcpListener,
}

impl Listeners {
    pub fn ws_addr(&self) -> std::io::Result<SocketAddr> {
        self.ws.local_addr()
    }

    pub fn http_addr(&self) -> std::io::Result<SocketAddr> {
        self.http.local_addr()
    }
}

pub struct RelayServer {
    config: RelayConfig,
    engine: Arc<BroadcastEngine>,
    snapshots: Arc<SnapshotService>,
    counters: Arc<ConnectionCounters>,
    rocks: Option<Arc<RocksSnapshotStore>>,
}

impl RelayServer {
    /// Build a server, opening RocksDB if a storage path is configured and
    /// registering the configured documents.
    pub fn new(config: RelayConfig) -> Result<Self, ServerError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

        match &config.storage_path {
            Some(path) => {
                let store = Arc::new(RocksSnapshotStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?);
                for id in &config.documents {
                    store.register_document(id)?;
                }
                log::info!(
                    "Opened snapshot store at {} ({} documents)",
                    path.display(),
                    store.list_documents()?.len()
                );
                let directory: Arc<dyn DocumentDirectory> = Arc::new(RocksDirectory::new(store.clone()));
                let snapshots: Arc<dyn SnapshotStore> = store.clone();
                let mut server = Self::with_parts(config, directory, snapshots, clock);
                server.rocks = Some(store);
                Ok(server)
            }
            None => {
                let directory = Arc::new(MemoryDirectory::with_documents(config.documents.clone()));
                log::info!("In-memory mode ({} documents)", directory.len());
                Ok(Self::with_parts(
                    config,
                    directory,
                    Arc::new(MemorySnapshotStore::new()),
                    clock,
                ))
            }
        }
    }

    /// Build a server from explicit collaborators.
    pub fn with_parts(
        config: RelayConfig,
        directory: Arc<dyn DocumentDirectory>,
        store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rooms = Arc::new(RoomRegistry::new(directory.clone(), config.max_peers_per_room));
        let snapshots = Arc::new(SnapshotService::new(&config, directory, store, clock));
        Self {
            engine: Arc::new(BroadcastEngine::new(rooms)),
            snapshots,
            counters: Arc::new(ConnectionCounters::default()),
            rocks: None,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<BroadcastEngine> {
        &self.engine
    }

    pub fn snapshots(&self) -> &Arc<SnapshotService> {
        &self.snapshots
    }

    /// The RocksDB store, when persistence is enabled.
    pub fn rocks(&self) -> Option<&Arc<RocksSnapshotStore>> {
        self.rocks.as_ref()
    }

    pub async fn bind(&self) -> Result<Listeners, ServerError> {
        let ws = TcpListener::bind(&self.config.ws_addr).await?;
        let http = TcpListener::bind(&self.config.http_addr).await?;
        Ok(Listeners { ws, http })
    }

    /// Bind and serve until a listener fails.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listeners = self.bind().await?;
        self.serve(listeners).await
    }

    pub async fn serve(self: Arc<Self>, listeners: Listeners) -> Result<(), ServerError> {
        let Listeners { ws, http } = listeners;
        log::info!("Relay listening on ws://{}", ws.local_addr()?);
        log::info!("Snapshot API listening on http://{}", http.local_addr()?);

        let app = crate::http::router(self.snapshots.clone());
        tokio::select! {
            result = axum::serve(http, app).into_future() => {
                result?;
                Ok(())
            }
            result = self.accept_loop(ws) => result,
        }
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let session = Session::new(addr, self.engine.clone(), self.counters.clone());
            tokio::spawn(async move {
                if let Err(e) = session.run(stream).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let c = &self.counters;
        ServerStats {
            total_connections: c.total_connections.load(Ordering::Relaxed),
            active_connections: c.active_connections.load(Ordering::Relaxed),
            rejected_not_found: c.rejected_not_found.load(Ordering::Relaxed),
            rejected_full: c.rejected_full.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            pings: c.pings.load(Ordering::Relaxed),
            active_rooms: self.engine.rooms().room_count().await,
            broadcast: self.engine.stats(),
            snapshots: self.snapshots.stats(),
        }
    }
}
