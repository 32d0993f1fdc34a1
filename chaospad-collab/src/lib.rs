//! # chaospad-collab — Real-time relay and snapshot store for ChaosPad
//!
//! Clients editing the same document exchange opaque update frames through a
//! per-document room, and periodically push full-state snapshots over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ws /ws/{doc}    ┌──────────────┐
//! │   Client    │ ◄───────────────► │ RelayServer  │
//! │  (editor)   │   [tag][payload]  │   Session    │
//! └──────┬──────┘                   └──────┬───────┘
//!        │                                 │
//!        │ POST /api/v1/snapshot/{doc}     ▼
//!        │                          ┌──────────────┐
//!        └────────────────────────► │ RoomRegistry │──► BroadcastEngine
//!                                   └──────────────┘
//!                                   ┌──────────────┐
//!                                   │SnapshotService──► SnapshotStore
//!                                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Frame tags, decoding, close reasons
//! - [`room`] — Room membership and admission
//! - [`broadcast`] — Best-effort fan-out with eviction
//! - [`session`] — Per-connection WebSocket state machine
//! - [`gate`] — Size guard, rate gate, per-document locks
//! - [`snapshot`] — Snapshot read/write service
//! - [`storage`] — Snapshot stores (memory, RocksDB)
//! - [`http`] — Snapshot HTTP endpoints
//! - [`server`] — Listener wiring and stats

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod gate;
pub mod http;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastEngine, BroadcastReport, BroadcastStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RelayConfig;
pub use directory::{DirectoryError, DocumentDirectory, MemoryDirectory};
pub use error::SnapshotError;
pub use gate::{DocumentLocks, GateDecision, SizeCheck, SizeGuard, SizeHint, WriteGate};
pub use protocol::{CloseReason, Frame, FrameTag};
pub use room::{Admission, LeaveOutcome, Peer, PeerId, RoomRegistry, SendError};
pub use server::{Listeners, RelayServer, ServerError, ServerStats};
pub use session::{Session, SessionError, SessionState};
pub use snapshot::{SnapshotService, SnapshotStats, Submission, SubmissionBody, WriteOutcome};
pub use storage::{
    MemorySnapshotStore, RocksDirectory, RocksSnapshotStore, SnapshotId, SnapshotRecord, SnapshotStore,
    StoreConfig, StoreError,
};
