//! # logos-revisions: revision history sync for Logos
//!
//! Tracks every saved version of an open document, keeps saves flowing
//! while online, offline or in a collaborative session, compacts dense
//! history for display and resolves documents changed outside the editor.
//!
//! ## Architecture
//!
//! ```text
//!   editor events                         server messages
//!        │                                      │
//!        ▼                                      ▼
//! ┌──────────────────────────────────────────────────────┐
//! │ RevisionEngine::handle(event, &surface) -> Vec<Effect>│
//! │  ┌──────────────┐   ┌──────────────────┐             │
//! │  │ SyncProtocol │◄──│ ConflictResolver │             │
//! │  └──┬────────┬──┘   └──────────────────┘             │
//! │     ▼        ▼                                       │
//! │ RevisionStore  OfflineQueue ──► QueueStore (RocksDB) │
//! │     │                                                │
//! │     ▼ compact()                                      │
//! │ CompactView                                          │
//! └───────┬───────────────┬──────────────┬───────────────┘
//!         ▼               ▼              ▼
//!     Transport       DiffWorker     host / UI
//! ```
//!
//! ## Modules
//!
//! - [`revision`]: Revision records, paths, patches
//! - [`compaction`]: Display grouping of revision history
//! - [`store`]: Per-document revision cache
//! - [`offline`]: Persisted queue of offline saves
//! - [`sync`]: Save lifecycle and message correlation
//! - [`conflict`]: External-change resolution
//! - [`worker`]: Diff process host (tokio task, bounded mailbox)
//! - [`protocol`]: Transport commands, server messages, wire frames
//! - [`storage`]: Durable queue storage (RocksDB / memory)
//! - [`engine`]: Event/effect front door
//! - [`runtime`]: Async loop driving the engine

pub mod arbitration;
pub mod compaction;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod offline;
pub mod protocol;
pub mod revision;
pub mod runtime;
pub mod storage;
pub mod store;
pub mod sync;
pub mod worker;

// Re-exports for convenience
pub use arbitration::{Arbiter, AssumeMaster, Role, SessionArbiter, SingleUser};
pub use compaction::{compact, CompactView, GroupingRule, DEFAULT_GROUP_WINDOW_MS};
pub use config::EngineConfig;
pub use conflict::{ConflictChoice, ConflictResolver};
pub use engine::{
    Clock, DocumentSurface, Effect, EngineEvent, ManualClock, Notice, RevisionEngine, SystemClock,
};
pub use error::RevisionError;
pub use offline::{OfflineQueue, PendingOfflineEntry};
pub use protocol::{Frame, NextAction, ProtocolError, ServerMessage, TransportCommand};
pub use revision::{DocPath, Patch, RevisionId, RevisionRecord};
pub use runtime::{ChannelTransport, HostEffect, RuntimeHandle, Transport};
pub use storage::{MemoryQueueStore, QueueStore, RocksQueueStore, StoreConfig, StoreError};
pub use store::{DocumentRevisionState, PreviewEntry, RevisionStore};
pub use sync::{SaveOrigin, SaveRequest, SaveStage, SyncProtocol};
pub use worker::{
    process, BackendError, DiffBackend, DiffRange, DiffRequest, DiffResponse, DiffWorker, RangeKind,
    RecoveryDecision, RecoveryMode, RecoveryVerdict, RequestId, RevisionAction, WorkerError,
};
