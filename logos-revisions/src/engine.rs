//! Event/effect front door of the revision engine.
//!
//! ```text
//!   EngineEvent ──► RevisionEngine::handle(event, surface) ──► Vec<Effect>
//!                        │                    │
//!                   SyncProtocol      ConflictResolver
//!                        │
//!          RevisionStore · OfflineQueue · CompactionEngine
//! ```
//!
//! The engine never performs I/O. Transport commands, diff requests,
//! content replacement and UI notices are returned as [`Effect`]s for the
//! host (or [`crate::runtime`]) to carry out. The document surface is passed
//! into every call instead of being looked up globally.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::arbitration::{Arbiter, SingleUser};
use crate::config::EngineConfig;
use crate::conflict::{ConflictChoice, ConflictResolver};
use crate::error::RevisionError;
use crate::offline::OfflineQueue;
use crate::protocol::{ServerMessage, TransportCommand};
use crate::revision::{DocPath, RevisionId, RevisionRecord};
use crate::storage::QueueStore;
use crate::store::RevisionStore;
use crate::sync::{SaveStage, SyncProtocol};
use crate::worker::{DiffRange, DiffRequest, DiffResponse};

/// Read access to the editor's documents.
pub trait DocumentSurface {
    /// Current text of an open document.
    fn content(&self, path: &DocPath) -> Option<String>;

    /// Unsaved local changes exist.
    fn is_dirty(&self, path: &DocPath) -> bool;

    /// Never saved to disk; such documents get no revisions.
    fn is_new_file(&self, path: &DocPath) -> bool;

    /// The focused document, if any.
    fn active_document(&self) -> Option<DocPath>;
}

/// Millisecond clock revision ids are drawn from.
pub trait Clock: Send {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Hand-driven clock; clones share the time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self(Arc::new(AtomicU64::new(now_ms)))
    }

    pub fn set(&self, now_ms: u64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything the engine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Opened { path: DocPath },
    LocalEdit { path: DocPath, contributors: Vec<String> },
    SaveRequested { path: DocPath, silent: bool },
    ExternalChange { path: DocPath },
    Closed { path: DocPath },
    Removed { path: DocPath, is_folder: bool },
    Renamed { from: DocPath, to: DocPath },
    /// A debounce timer scheduled through [`Effect::ScheduleDebounce`] fired.
    DebounceElapsed { path: DocPath, generation: u64 },
    AutosaveTick,
    ConnectivityChanged { online: bool },
    Server(ServerMessage),
    Diff(DiffResponse),
    PreviewRevision { path: DocPath, id: RevisionId },
    ApplyRevision { path: DocPath, id: RevisionId },
    ToggleCompactView { path: DocPath },
    ConflictDecision { path: DocPath, choice: ConflictChoice },
    SetAutosave { enabled: bool },
}

/// Something the host has to carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Transport(TransportCommand),
    Diff(DiffRequest),
    /// Replace the document's text (revision applied, conflict resolved).
    ReplaceContent { path: DocPath, content: String },
    /// Deliver `DebounceElapsed { path, generation }` after `delay`.
    ScheduleDebounce {
        path: DocPath,
        generation: u64,
        delay: Duration,
    },
    Notify(Notice),
}

/// UI-facing notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Records to list for the document, oldest first.
    HistoryChanged {
        path: DocPath,
        revisions: Vec<RevisionRecord>,
    },
    Preview {
        path: DocPath,
        id: RevisionId,
        content: String,
        ranges: Vec<DiffRange>,
    },
    /// The user has to choose between reloading and keeping local content.
    ConflictPrompt { path: DocPath, server_content: String },
    AutosaveChanged { enabled: bool },
    Degraded(RevisionError),
}

/// The revision engine.
pub struct RevisionEngine {
    sync: SyncProtocol,
    conflicts: ConflictResolver,
}

impl RevisionEngine {
    pub fn new(
        config: &EngineConfig,
        offline: OfflineQueue,
        arbiter: Box<dyn Arbiter>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            sync: SyncProtocol::new(config, offline, arbiter, clock),
            conflicts: ConflictResolver::new(),
        }
    }

    /// Single-user engine on the system clock, queue persisted in `store`.
    pub fn with_store(config: &EngineConfig, store: Box<dyn QueueStore>) -> Self {
        let offline = OfflineQueue::open(store, config.offline_queue_capacity);
        Self::new(config, offline, Box::new(SingleUser), Box::new(SystemClock))
    }

    /// Effects due right after construction: a corrupt-queue warning and
    /// the replay of entries left over from the previous run.
    pub fn startup(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(e) = self.sync.offline_mut().take_recovery_error() {
            effects.push(Effect::Notify(Notice::Degraded(e)));
        }
        self.sync.pump_replay(&mut effects);
        effects
    }

    pub fn handle(&mut self, event: EngineEvent, surface: &dyn DocumentSurface) -> Vec<Effect> {
        let mut fx = Vec::new();
        match event {
            EngineEvent::Opened { path } => self.sync.on_open(&path, surface, &mut fx),
            EngineEvent::LocalEdit { path, contributors } => {
                self.sync.on_local_edit(&path, &contributors, surface, &mut fx)
            }
            EngineEvent::SaveRequested { path, silent } => {
                self.sync.on_save_requested(&path, silent, surface, &mut fx)
            }
            EngineEvent::ExternalChange { path } => {
                self.conflicts.on_external_change(&path, &mut self.sync, &mut fx)
            }
            EngineEvent::Closed { path } => {
                self.conflicts.forget(&path, false, &mut self.sync, &mut fx);
                self.sync.close(&path, &mut fx);
            }
            EngineEvent::Removed { path, is_folder } => {
                self.conflicts.forget(&path, is_folder, &mut self.sync, &mut fx);
                self.sync.remove(&path, is_folder, &mut fx);
            }
            EngineEvent::Renamed { from, to } => {
                self.conflicts.rename(&from, &to);
                self.sync.rename(&from, &to, &mut fx);
            }
            EngineEvent::DebounceElapsed { path, generation } => {
                self.sync.on_debounce(&path, generation, surface, &mut fx)
            }
            EngineEvent::AutosaveTick => self.sync.on_autosave_tick(surface, &mut fx),
            EngineEvent::ConnectivityChanged { online } => self.sync.set_online(online, &mut fx),
            EngineEvent::Server(message) => self.on_server(message, surface, &mut fx),
            EngineEvent::Diff(response) => {
                if self.conflicts.owns(response.request()) {
                    self.conflicts.on_diff(response, &mut self.sync, &mut fx);
                } else {
                    self.sync.on_diff(response, &mut fx);
                }
            }
            EngineEvent::PreviewRevision { path, id } => self.sync.preview(&path, id, &mut fx),
            EngineEvent::ApplyRevision { path, id } => self.sync.apply(&path, id, &mut fx),
            EngineEvent::ToggleCompactView { path } => self.sync.toggle_compact_view(&path, &mut fx),
            EngineEvent::ConflictDecision { path, choice } => {
                self.conflicts.on_decision(&path, choice, &mut self.sync, &mut fx)
            }
            EngineEvent::SetAutosave { enabled } => {
                self.conflicts.set_autosave(enabled, &mut self.sync, &mut fx)
            }
        }
        fx
    }

    fn on_server(&mut self, message: ServerMessage, surface: &dyn DocumentSurface, fx: &mut Vec<Effect>) {
        match message {
            ServerMessage::ConfirmSave { path, id } => self.sync.on_confirm(&path, id, fx),
            ServerMessage::RevisionHistory {
                path,
                revisions,
                id,
                next_action,
            } => self.sync.on_history(&path, revisions, id, next_action, fx),
            ServerMessage::RealFileContents {
                path,
                contents,
                next_action,
            } => self
                .conflicts
                .on_real_file_contents(&path, contents, next_action, &mut self.sync, surface, fx),
            ServerMessage::ServerError {
                from_method,
                message,
                path,
                id,
            } => {
                if from_method == "getRealFileContents" {
                    if let Some(path) = &path {
                        self.conflicts.on_fetch_failed(path, &mut self.sync, fx);
                    }
                }
                self.sync.on_server_error(from_method, message, path, id, fx);
            }
        }
    }

    /// Persist the offline queue; call before the process exits.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.sync.offline().flush() {
            log::error!("Failed to persist offline queue on shutdown: {e}");
        }
    }

    pub fn store(&self) -> &RevisionStore {
        self.sync.store()
    }

    pub fn offline(&self) -> &OfflineQueue {
        self.sync.offline()
    }

    pub fn sync(&self) -> &SyncProtocol {
        &self.sync
    }

    pub fn conflicts(&self) -> &ConflictResolver {
        &self.conflicts
    }

    pub fn autosave(&self) -> bool {
        self.sync.autosave()
    }

    pub fn is_online(&self) -> bool {
        self.sync.is_online()
    }

    pub fn stage(&self, path: &DocPath) -> SaveStage {
        self.sync.stage(path)
    }
}
