//! Save lifecycle and message correlation.
//!
//! Per document:
//! ```text
//!            debounce / explicit save
//!   Idle ───────────────────────────► PendingDiff ──(patch)──► PendingConfirm ──(confirm)──► Committed
//!    ▲                                   │   │                       │
//!    └─────────(empty patch / failure)───┘   └──(offline)──► OfflineQueue
//! ```
//!
//! Invariants kept here:
//! - at most one diff computation is outstanding per document; a save that
//!   arrives meanwhile waits in `queued_save`, an edit sets
//!   `edited_during_roundtrip` and is debounced again after the response;
//! - the offline queue is replayed one entry at a time, the next entry only
//!   after the previous one resolved (confirmed, empty, or failed);
//! - results for documents that were closed are dropped on arrival;
//! - saves still awaiting confirmation when the transport drops go back to
//!   the offline queue.

use std::collections::HashMap;
use std::time::Duration;

use crate::arbitration::Arbiter;
use crate::config::EngineConfig;
use crate::engine::{Clock, DocumentSurface, Effect, Notice};
use crate::error::RevisionError;
use crate::offline::{OfflineQueue, PendingOfflineEntry};
use crate::protocol::{NextAction, TransportCommand};
use crate::revision::{merge_contributors, DocPath, Patch, RevisionId, RevisionRecord};
use crate::store::{PreviewEntry, RevisionStore};
use crate::worker::{DiffRange, DiffRequest, DiffResponse, RequestId, RevisionAction};

/// Where a save came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOrigin {
    /// Typing, explicit save, applied revision or conflict resolution.
    Local,
    /// Replay of the offline entry created at `created_at`.
    Replay { created_at: u64 },
}

/// A save waiting to be turned into a revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    pub content: String,
    /// Empty means "whoever edited since the last save".
    pub contributors: Vec<String>,
    pub silent: bool,
    pub restoring: Option<RevisionId>,
    pub force_revision_list: bool,
    pub origin: SaveOrigin,
}

impl SaveRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            contributors: Vec::new(),
            silent: false,
            restoring: None,
            force_revision_list: false,
            origin: SaveOrigin::Local,
        }
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn restoring(mut self, id: RevisionId) -> Self {
        self.restoring = Some(id);
        self
    }

    pub fn force_revision_list(mut self) -> Self {
        self.force_revision_list = true;
        self
    }

    fn replay(entry: &PendingOfflineEntry) -> Self {
        Self {
            content: entry.content.clone(),
            contributors: entry.contributors.clone(),
            silent: entry.silent,
            restoring: entry.restoring,
            force_revision_list: false,
            origin: SaveOrigin::Replay {
                created_at: entry.created_at,
            },
        }
    }
}

/// Observable save state of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStage {
    Idle,
    PendingDiff,
    PendingConfirm,
    Committed,
}

/// A diff request whose response has not arrived.
#[derive(Debug, Clone)]
enum Outstanding {
    Save {
        path: DocPath,
        id: RevisionId,
        request: SaveRequest,
    },
    Reconstruct {
        path: DocPath,
        target: RevisionId,
        action: RevisionAction,
    },
}

impl Outstanding {
    fn path(&self) -> &DocPath {
        match self {
            Self::Save { path, .. } | Self::Reconstruct { path, .. } => path,
        }
    }

    fn path_mut(&mut self) -> &mut DocPath {
        match self {
            Self::Save { path, .. } | Self::Reconstruct { path, .. } => path,
        }
    }
}

/// A local save sent to the server and not yet confirmed, kept so it can be
/// parked offline if the connection drops first.
#[derive(Debug, Clone)]
struct Unconfirmed {
    path: DocPath,
    request: SaveRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayState {
    Idle,
    /// Head entry's document has no history yet; it was requested.
    AwaitingHistory { created_at: u64 },
    /// Head entry is going through the save pipeline. `id` is known once
    /// its diff was dispatched.
    InFlight { created_at: u64, id: Option<RevisionId> },
}

/// Coordinates RevisionStore, OfflineQueue, the diff process and the transport.
pub struct SyncProtocol {
    store: RevisionStore,
    offline: OfflineQueue,
    arbiter: Box<dyn Arbiter>,
    clock: Box<dyn Clock>,
    online: bool,
    autosave: bool,
    debounce: Duration,
    default_user: Option<String>,
    outstanding: HashMap<RequestId, Outstanding>,
    unconfirmed: HashMap<RevisionId, Unconfirmed>,
    next_request: RequestId,
    last_issued_id: RevisionId,
    replay: ReplayState,
    last_replayed: Option<RevisionId>,
}

impl SyncProtocol {
    pub fn new(
        config: &EngineConfig,
        offline: OfflineQueue,
        arbiter: Box<dyn Arbiter>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            store: RevisionStore::new(config.grouping),
            offline,
            arbiter,
            clock,
            online: config.start_online,
            autosave: config.autosave_enabled,
            debounce: config.debounce,
            default_user: config.default_user.clone(),
            outstanding: HashMap::new(),
            unconfirmed: HashMap::new(),
            next_request: 1,
            last_issued_id: 0,
            replay: ReplayState::Idle,
            last_replayed: None,
        }
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn store(&self) -> &RevisionStore {
        &self.store
    }

    pub fn offline(&self) -> &OfflineQueue {
        &self.offline
    }

    pub(crate) fn offline_mut(&mut self) -> &mut OfflineQueue {
        &mut self.offline
    }

    pub fn arbiter(&self) -> &dyn Arbiter {
        self.arbiter.as_ref()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn autosave(&self) -> bool {
        self.autosave
    }

    pub(crate) fn set_autosave(&mut self, enabled: bool) {
        self.autosave = enabled;
    }

    /// Diff requests still awaiting a response for `path`.
    pub fn outstanding_requests(&self, path: &DocPath) -> usize {
        self.outstanding.values().filter(|o| o.path() == path).count()
    }

    pub fn stage(&self, path: &DocPath) -> SaveStage {
        match self.store.peek(path) {
            Some(state) if state.pending_worker_roundtrip() => SaveStage::PendingDiff,
            Some(state) if !state.pending_server_confirm().is_empty() => SaveStage::PendingConfirm,
            Some(state) if !state.all().is_empty() => SaveStage::Committed,
            _ => SaveStage::Idle,
        }
    }

    pub(crate) fn next_request_id(&mut self) -> RequestId {
        let id = self.next_request;
        self.next_request += 1;
        id
    }

    /// Next revision id: the clock, forced strictly increasing.
    fn allocate_id(&mut self) -> RevisionId {
        let id = self.clock.now_ms().max(self.last_issued_id + 1);
        self.last_issued_id = id;
        id
    }

    // ─── Document lifecycle ──────────────────────────────────────

    pub(crate) fn on_open(&mut self, path: &DocPath, surface: &dyn DocumentSurface, fx: &mut Vec<Effect>) {
        self.store.get(path);
        if surface.is_new_file(path) {
            return;
        }
        fx.push(Effect::Transport(TransportCommand::GetRevisionHistory {
            path: path.clone(),
            id: None,
            next_action: None,
        }));
    }

    pub(crate) fn close(&mut self, path: &DocPath, fx: &mut Vec<Effect>) {
        self.drop_document(path, |p| p == path);
        self.store.forget(path);
        fx.push(Effect::Diff(DiffRequest::CloseFile { path: path.clone() }));
        log::debug!("Closed {path}");
        self.pump_replay(fx);
    }

    pub(crate) fn remove(&mut self, path: &DocPath, is_folder: bool, fx: &mut Vec<Effect>) {
        if is_folder {
            self.drop_document(path, |p| p == path || p.is_within(path));
            self.store.forget_folder(path);
        } else {
            self.drop_document(path, |p| p == path);
            self.store.forget(path);
        }
        fx.push(Effect::Transport(TransportCommand::RemoveRevision {
            path: path.clone(),
            is_folder,
        }));
        self.pump_replay(fx);
    }

    pub(crate) fn rename(&mut self, from: &DocPath, to: &DocPath, fx: &mut Vec<Effect>) {
        self.store.rename(from, to);
        self.offline.rename_path(from, to);
        for outstanding in self.outstanding.values_mut() {
            if outstanding.path() == from {
                *outstanding.path_mut() = to.clone();
            }
        }
        for unconfirmed in self.unconfirmed.values_mut() {
            if &unconfirmed.path == from {
                unconfirmed.path = to.clone();
            }
        }
        fx.push(Effect::Transport(TransportCommand::MoveRevision {
            path: from.clone(),
            new_path: to.clone(),
        }));
        // A history requested under the old path will be dropped on arrival.
        if matches!(self.replay, ReplayState::AwaitingHistory { .. }) {
            self.replay = ReplayState::Idle;
            self.pump_replay(fx);
        }
    }

    /// Forget outstanding requests and offline entries for matching paths.
    /// An offline entry being replayed is abandoned with them.
    fn drop_document(&mut self, path: &DocPath, matches: impl Fn(&DocPath) -> bool) {
        self.outstanding.retain(|_, o| !matches(o.path()));
        self.unconfirmed.retain(|_, u| !matches(&u.path));
        let head_dropped = self.offline.head().is_some_and(|head| matches(&head.path));
        let removed = self.offline.remove_path(path);
        if removed > 0 {
            log::info!("Dropped {removed} offline revision(s) of {path}");
        }
        if head_dropped {
            self.replay = ReplayState::Idle;
        }
    }

    // ─── Saving ──────────────────────────────────────────────────

    pub(crate) fn on_local_edit(
        &mut self,
        path: &DocPath,
        contributors: &[String],
        surface: &dyn DocumentSurface,
        fx: &mut Vec<Effect>,
    ) {
        let autosave = self.autosave;
        let delay = self.debounce;
        let state = self.store.get(path);
        state.note_contributors(contributors);

        if !autosave || surface.is_new_file(path) {
            return;
        }
        state.debounce_generation += 1;
        if state.pending_worker_roundtrip {
            state.edited_during_roundtrip = true;
            return;
        }
        fx.push(Effect::ScheduleDebounce {
            path: path.clone(),
            generation: state.debounce_generation,
            delay,
        });
    }

    pub(crate) fn on_debounce(
        &mut self,
        path: &DocPath,
        generation: u64,
        surface: &dyn DocumentSurface,
        fx: &mut Vec<Effect>,
    ) {
        if !self.autosave {
            return;
        }
        let Some(state) = self.store.peek_mut(path) else {
            return;
        };
        if generation != state.debounce_generation {
            log::trace!("Stale debounce for {path} ({generation})");
            return;
        }
        if state.pending_worker_roundtrip {
            state.edited_during_roundtrip = true;
            return;
        }
        if let Some(content) = surface.content(path) {
            self.save(path, SaveRequest::new(content).silent(true), fx);
        }
    }

    pub(crate) fn on_save_requested(
        &mut self,
        path: &DocPath,
        silent: bool,
        surface: &dyn DocumentSurface,
        fx: &mut Vec<Effect>,
    ) {
        if surface.is_new_file(path) {
            log::debug!("Not revisioning new file {path}");
            return;
        }
        match surface.content(path) {
            Some(content) => self.save(path, SaveRequest::new(content).silent(silent), fx),
            None => log::warn!("Save requested for {path} but the surface has no content"),
        }
    }

    pub(crate) fn on_autosave_tick(&mut self, surface: &dyn DocumentSurface, fx: &mut Vec<Effect>) {
        if let Err(e) = self.offline.flush() {
            log::warn!("Failed to persist offline queue: {e}");
        }
        if !self.autosave {
            return;
        }
        let Some(path) = surface.active_document() else {
            return;
        };
        if !surface.is_dirty(&path) || surface.is_new_file(&path) {
            return;
        }
        if self.store.peek(&path).is_some_and(|s| s.pending_worker_roundtrip) {
            return;
        }
        if let Some(content) = surface.content(&path) {
            self.save(&path, SaveRequest::new(content).silent(true), fx);
        }
    }

    /// Entry point for every local save.
    pub(crate) fn save(&mut self, path: &DocPath, mut request: SaveRequest, fx: &mut Vec<Effect>) {
        if !self.arbiter.may_write(path) {
            log::debug!("Not the session master for {path}, skipping save");
            return;
        }

        let state = self.store.get(path);
        if request.contributors.is_empty() {
            request.contributors = state.take_changed_users();
        }
        if request.contributors.is_empty() {
            request.contributors.extend(self.default_user.iter().cloned());
        }

        if !self.online || !self.offline.is_empty() {
            self.enqueue_offline(path, request, fx);
            return;
        }

        let state = self.store.get(path);
        if state.pending_worker_roundtrip {
            let queued = match state.queued_save.take() {
                Some(mut previous) => {
                    merge_contributors(&mut previous.contributors, &request.contributors);
                    SaveRequest {
                        contributors: previous.contributors,
                        ..request
                    }
                }
                None => request,
            };
            state.queued_save = Some(queued);
            return;
        }
        self.dispatch(path, request, fx);
    }

    /// Store a revision whose patch the diff process already produced
    /// (recovered server content).
    pub(crate) fn store_recovered(
        &mut self,
        path: &DocPath,
        patch: Vec<Patch>,
        content: String,
        fx: &mut Vec<Effect>,
    ) {
        if !self.arbiter.may_write(path) {
            return;
        }
        let Some(state) = self.store.peek_mut(path) else {
            log::debug!("Dropping recovered content of closed {path}");
            return;
        };
        let mut request = SaveRequest::new(content).force_revision_list();
        request.contributors = state.take_changed_users();
        if request.contributors.is_empty() {
            request.contributors.extend(self.default_user.iter().cloned());
        }

        if !self.online || !self.offline.is_empty() {
            self.enqueue_offline(path, request, fx);
            return;
        }
        let id = self.allocate_id();
        let record = RevisionRecord::new(id, patch).with_contributors(request.contributors.iter().cloned());
        if !record.has_changes() {
            log::debug!("Recovered content of {path} matches history, nothing to store");
            return;
        }
        self.send_save(path, record, request, fx);
    }

    fn enqueue_offline(&mut self, path: &DocPath, request: SaveRequest, fx: &mut Vec<Effect>) {
        let created_at = self.allocate_id();
        let queued = self.offline.enqueue(PendingOfflineEntry {
            created_at,
            depends_on: None,
            path: path.clone(),
            content: request.content,
            contributors: request.contributors,
            silent: request.silent,
            restoring: request.restoring,
        });
        if !queued {
            fx.push(Effect::Notify(Notice::Degraded(RevisionError::OfflineQueueFull {
                path: path.clone(),
            })));
        } else if !self.online {
            fx.push(Effect::Notify(Notice::Degraded(RevisionError::TransportUnavailable {
                path: path.clone(),
            })));
        }
        self.pump_replay(fx);
    }

    /// Submit a diff computation. The caller guarantees no other one is
    /// outstanding for `path`.
    fn dispatch(&mut self, path: &DocPath, request: SaveRequest, fx: &mut Vec<Effect>) {
        let id = self.allocate_id();
        let request_id = self.next_request_id();
        let state = self.store.get(path);
        state.pending_worker_roundtrip = true;
        let base = state.base_records();

        if let SaveOrigin::Replay { created_at } = request.origin {
            self.replay = ReplayState::InFlight {
                created_at,
                id: Some(id),
            };
        }
        log::debug!("Requesting diff for {path} (revision {id}, request {request_id})");
        fx.push(Effect::Diff(DiffRequest::ComputeDiff {
            request: request_id,
            path: path.clone(),
            base,
            content: request.content.clone(),
        }));
        self.outstanding.insert(
            request_id,
            Outstanding::Save {
                path: path.clone(),
                id,
                request,
            },
        );
    }

    fn send_save(&mut self, path: &DocPath, record: RevisionRecord, request: SaveRequest, fx: &mut Vec<Effect>) {
        let id = record.id;
        self.store.get(path).add_pending(record.clone());
        fx.push(Effect::Transport(TransportCommand::SaveRevision {
            path: path.clone(),
            revision: record,
            force_revision_list: request.force_revision_list,
        }));
        // Replayed entries stay at the head of the queue until confirmed.
        if request.origin == SaveOrigin::Local {
            self.unconfirmed.insert(
                id,
                Unconfirmed {
                    path: path.clone(),
                    request,
                },
            );
        }
    }

    // ─── Diff process responses ──────────────────────────────────

    pub(crate) fn on_diff(&mut self, response: DiffResponse, fx: &mut Vec<Effect>) {
        let Some(outstanding) = self.outstanding.remove(&response.request()) else {
            log::debug!(
                "Dropping diff result {} for {}",
                response.request(),
                response.path()
            );
            return;
        };

        match (outstanding, response) {
            (Outstanding::Save { path, id, request }, DiffResponse::Patch { patch, .. }) => {
                self.on_patch(&path, id, request, patch, fx)
            }
            (Outstanding::Save { path, request, .. }, DiffResponse::Failed { message, .. }) => {
                self.on_save_failed(&path, request, message, fx)
            }
            (
                Outstanding::Reconstruct { path, target, action },
                DiffResponse::Reconstructed { content, ranges, .. },
            ) => self.on_reconstructed(&path, target, action, content, ranges, fx),
            (Outstanding::Reconstruct { path, target, .. }, DiffResponse::Failed { message, .. }) => {
                log::warn!("Reconstructing revision {target} of {path} failed: {message}");
                fx.push(Effect::Notify(Notice::Degraded(
                    RevisionError::DiffComputationFailure { path, message },
                )));
            }
            (outstanding, response) => {
                log::warn!(
                    "Diff response {:?} does not match request for {}",
                    response,
                    outstanding.path()
                );
                if let Outstanding::Save { path, request, .. } = outstanding {
                    self.on_save_failed(&path, request, "unexpected response".into(), fx);
                }
            }
        }
    }

    fn on_patch(
        &mut self,
        path: &DocPath,
        id: RevisionId,
        request: SaveRequest,
        patch: Vec<Patch>,
        fx: &mut Vec<Effect>,
    ) {
        let Some(state) = self.store.peek_mut(path) else {
            return;
        };
        state.pending_worker_roundtrip = false;

        let record = RevisionRecord::new(id, patch)
            .with_contributors(request.contributors.iter().cloned())
            .with_silent(request.silent)
            .with_restoring(request.restoring);

        if !record.has_changes() {
            log::debug!("Empty patch for {path}, nothing to save");
            if let SaveOrigin::Replay { created_at } = request.origin {
                self.finish_replay_entry(created_at, None, fx);
            }
        } else if self.online {
            self.send_save(path, record, request, fx);
        } else {
            match request.origin {
                SaveOrigin::Local => self.enqueue_offline(path, request, fx),
                SaveOrigin::Replay { .. } => {
                    log::info!("Went offline while replaying {path}, pausing replay");
                    self.replay = ReplayState::Idle;
                }
            }
        }

        self.after_roundtrip(path, fx);
    }

    fn on_save_failed(&mut self, path: &DocPath, request: SaveRequest, message: String, fx: &mut Vec<Effect>) {
        if let Some(state) = self.store.peek_mut(path) {
            state.pending_worker_roundtrip = false;
        }
        log::warn!("Diff computation for {path} failed: {message}");
        fx.push(Effect::Notify(Notice::Degraded(
            RevisionError::DiffComputationFailure {
                path: path.clone(),
                message,
            },
        )));
        if let SaveOrigin::Replay { created_at } = request.origin {
            log::warn!("Dropping offline revision {created_at} of {path}");
            self.finish_replay_entry(created_at, None, fx);
        }
        self.after_roundtrip(path, fx);
    }

    /// Run whatever waited for the diff round trip to finish.
    fn after_roundtrip(&mut self, path: &DocPath, fx: &mut Vec<Effect>) {
        let autosave = self.autosave;
        let delay = self.debounce;
        let Some(state) = self.store.peek_mut(path) else {
            return;
        };
        if state.pending_worker_roundtrip {
            return;
        }

        if let Some(queued) = state.queued_save.take() {
            match queued.origin {
                SaveOrigin::Replay { .. } => self.dispatch(path, queued, fx),
                SaveOrigin::Local => self.save(path, queued, fx),
            }
        } else if state.edited_during_roundtrip {
            state.edited_during_roundtrip = false;
            if autosave {
                fx.push(Effect::ScheduleDebounce {
                    path: path.clone(),
                    generation: state.debounce_generation,
                    delay,
                });
            }
        }
    }

    // ─── Server messages ─────────────────────────────────────────

    pub(crate) fn on_confirm(&mut self, path: &DocPath, id: RevisionId, fx: &mut Vec<Effect>) {
        let Some(state) = self.store.peek_mut(path) else {
            log::debug!("Dropping confirmation {id} for closed {path}");
            return;
        };

        if let Some(record) = state.take_pending(id) {
            self.unconfirmed.remove(&id);
            self.store.commit(path, record.confirmed());
            log::debug!("Committed revision {id} of {path}");
            self.notify_history(path, fx);
            if let ReplayState::InFlight {
                created_at,
                id: Some(replayed),
            } = self.replay
            {
                if replayed == id {
                    self.finish_replay_entry(created_at, Some(id), fx);
                }
            }
        } else if state.record(id).is_some_and(|r| r.confirmed) {
            log::debug!("Duplicate confirmation {id} for {path}");
        } else {
            log::warn!("Confirmation {id} for {path} matches no pending save, resyncing");
            fx.push(Effect::Notify(Notice::Degraded(RevisionError::StateDesync {
                path: path.clone(),
                id,
            })));
            fx.push(Effect::Transport(TransportCommand::GetRevisionHistory {
                path: path.clone(),
                id: Some(id),
                next_action: None,
            }));
        }
    }

    pub(crate) fn on_history(
        &mut self,
        path: &DocPath,
        revisions: Option<Vec<RevisionRecord>>,
        id: Option<RevisionId>,
        next_action: Option<NextAction>,
        fx: &mut Vec<Effect>,
    ) {
        if !self.store.contains(path) {
            log::debug!("Dropping history for closed {path}");
            return;
        }
        match revisions {
            Some(revisions) => {
                log::debug!("Loaded {} revision(s) of {path}", revisions.len());
                // New ids must sort after everything the server already has.
                if let Some(newest) = revisions.iter().map(|r| r.id).max() {
                    self.last_issued_id = self.last_issued_id.max(newest);
                }
                self.store.replace_history(path, revisions);
                let store = &self.store;
                self.unconfirmed
                    .retain(|id, u| store.peek(&u.path).is_some_and(|s| s.is_awaiting_confirm(*id)));
            }
            None => self.store.get(path).mark_history_loaded(),
        }

        let head_here = self.offline.head().is_some_and(|head| &head.path == path);
        let replay = self.replay;
        match replay {
            ReplayState::AwaitingHistory { .. } if head_here => {
                self.replay = ReplayState::Idle;
                self.pump_replay(fx);
            }
            ReplayState::InFlight {
                created_at,
                id: Some(replayed),
            } if head_here && self.store.get(path).record(replayed).is_some() => {
                self.finish_replay_entry(created_at, Some(replayed), fx);
            }
            _ => {}
        }

        match (id, next_action.and_then(NextAction::revision_action)) {
            (Some(id), Some(action)) => self.request_reconstruct(path, id, action, fx),
            _ => self.notify_history(path, fx),
        }
    }

    pub(crate) fn on_server_error(
        &mut self,
        from_method: String,
        message: String,
        path: Option<DocPath>,
        id: Option<RevisionId>,
        fx: &mut Vec<Effect>,
    ) {
        log::warn!("Server error from {from_method}: {message}");
        if from_method != "saveRevision" {
            return;
        }
        fx.push(Effect::Notify(Notice::Degraded(RevisionError::ServerRejection {
            method: from_method,
            path,
            id,
            message,
        })));

        // The record stays pending; only the replay moves on.
        if let Some(id) = id {
            self.unconfirmed.remove(&id);
        }
        if let ReplayState::InFlight {
            created_at,
            id: Some(replayed),
        } = self.replay
        {
            if id == Some(replayed) {
                log::warn!("Server rejected offline revision {replayed}, continuing replay");
                self.finish_replay_entry(created_at, None, fx);
            }
        }
    }

    // ─── Offline replay ──────────────────────────────────────────

    pub(crate) fn set_online(&mut self, online: bool, fx: &mut Vec<Effect>) {
        if self.online == online {
            return;
        }
        self.online = online;
        if online {
            log::info!("Transport online, {} offline revision(s) to replay", self.offline.len());
            self.pump_replay(fx);
        } else {
            log::info!("Transport offline");
            self.park_unconfirmed(fx);
        }
    }

    /// Move saves the server has not confirmed back into the offline queue.
    /// They are diffed and sent again once the transport returns, since the
    /// server may never have received them.
    fn park_unconfirmed(&mut self, fx: &mut Vec<Effect>) {
        match self.replay {
            ReplayState::InFlight { id: Some(id), .. } => {
                let head_path = self.offline.head().map(|head| head.path.clone());
                let retracted = head_path
                    .and_then(|path| self.store.peek_mut(&path))
                    .and_then(|state| state.take_pending(id));
                if retracted.is_some() {
                    log::info!("Offline revision {id} unconfirmed, replaying it again later");
                    self.replay = ReplayState::Idle;
                }
            }
            // The history request may have been lost with the connection.
            ReplayState::AwaitingHistory { .. } => self.replay = ReplayState::Idle,
            _ => {}
        }

        let mut unconfirmed: Vec<(RevisionId, Unconfirmed)> = self.unconfirmed.drain().collect();
        unconfirmed.sort_by_key(|(id, _)| *id);
        let mut parked = Vec::with_capacity(unconfirmed.len());
        for (id, Unconfirmed { path, request }) in unconfirmed {
            let retracted = self
                .store
                .peek_mut(&path)
                .and_then(|state| state.take_pending(id));
            if retracted.is_none() {
                continue;
            }
            parked.push(PendingOfflineEntry {
                created_at: id,
                depends_on: None,
                path,
                content: request.content,
                contributors: request.contributors,
                silent: request.silent,
                restoring: request.restoring,
            });
        }
        if parked.is_empty() {
            return;
        }

        log::info!("Parking {} unconfirmed revision(s) offline", parked.len());
        let paths: Vec<DocPath> = parked.iter().map(|e| e.path.clone()).collect();
        let rejected = self.offline.requeue_front(parked);
        for path in paths {
            let error = if rejected.iter().any(|e| e.path == path) {
                RevisionError::OfflineQueueFull { path }
            } else {
                RevisionError::TransportUnavailable { path }
            };
            let notice = Effect::Notify(Notice::Degraded(error));
            if !fx.contains(&notice) {
                fx.push(notice);
            }
        }
    }

    /// Submit the head of the offline queue unless a replay is in progress.
    pub(crate) fn pump_replay(&mut self, fx: &mut Vec<Effect>) {
        if !self.online || self.replay != ReplayState::Idle {
            return;
        }
        if let Some(previous) = self.last_replayed {
            self.offline.set_head_dependency(previous);
        }
        let Some(head) = self.offline.head().cloned() else {
            self.last_replayed = None;
            return;
        };

        let path = head.path.clone();
        let state = self.store.get(&path);
        if !state.history_loaded() {
            self.replay = ReplayState::AwaitingHistory {
                created_at: head.created_at,
            };
            fx.push(Effect::Transport(TransportCommand::GetRevisionHistory {
                path,
                id: None,
                next_action: None,
            }));
            return;
        }

        log::info!(
            "Replaying offline revision {} of {path} (after {:?})",
            head.created_at,
            head.depends_on
        );
        let request = SaveRequest::replay(&head);
        if state.pending_worker_roundtrip {
            if let Some(local) = state.queued_save.take() {
                // Newer than everything queued; goes to the back.
                if !self.requeue_local(&path, local) {
                    fx.push(Effect::Notify(Notice::Degraded(RevisionError::OfflineQueueFull {
                        path: path.clone(),
                    })));
                }
            }
            if let Some(state) = self.store.peek_mut(&path) {
                state.queued_save = Some(request);
            }
            self.replay = ReplayState::InFlight {
                created_at: head.created_at,
                id: None,
            };
        } else {
            self.dispatch(&path, request, fx);
        }
    }

    fn requeue_local(&mut self, path: &DocPath, request: SaveRequest) -> bool {
        let created_at = self.allocate_id();
        self.offline.enqueue(PendingOfflineEntry {
            created_at,
            depends_on: None,
            path: path.clone(),
            content: request.content,
            contributors: request.contributors,
            silent: request.silent,
            restoring: request.restoring,
        })
    }

    fn finish_replay_entry(&mut self, created_at: u64, resolved: Option<RevisionId>, fx: &mut Vec<Effect>) {
        if self.offline.head().is_some_and(|head| head.created_at == created_at) {
            self.offline.pop_head();
        }
        if let Some(id) = resolved {
            self.last_replayed = Some(id);
        }
        self.replay = ReplayState::Idle;
        if self.offline.is_empty() {
            log::info!("Offline queue drained");
        }
        self.pump_replay(fx);
    }

    // ─── History display ─────────────────────────────────────────

    fn notify_history(&mut self, path: &DocPath, fx: &mut Vec<Effect>) {
        let rule = self.store.rule();
        if let Some(state) = self.store.peek_mut(path) {
            fx.push(Effect::Notify(Notice::HistoryChanged {
                path: path.clone(),
                revisions: state.display_records(rule),
            }));
        }
    }

    pub(crate) fn toggle_compact_view(&mut self, path: &DocPath, fx: &mut Vec<Effect>) {
        let Some(state) = self.store.peek_mut(path) else {
            return;
        };
        let enabled = !state.use_compact_view();
        state.set_compact_view(enabled);
        self.notify_history(path, fx);
    }

    pub(crate) fn preview(&mut self, path: &DocPath, id: RevisionId, fx: &mut Vec<Effect>) {
        let Some(state) = self.store.peek(path) else {
            return;
        };
        if let Some(entry) = state.preview(id) {
            fx.push(Effect::Notify(Notice::Preview {
                path: path.clone(),
                id,
                content: entry.content.clone(),
                ranges: entry.ranges.clone(),
            }));
            return;
        }
        self.load_revision(path, id, RevisionAction::Preview, fx);
    }

    pub(crate) fn apply(&mut self, path: &DocPath, id: RevisionId, fx: &mut Vec<Effect>) {
        if self.store.contains(path) {
            self.load_revision(path, id, RevisionAction::Apply, fx);
        }
    }

    fn load_revision(&mut self, path: &DocPath, id: RevisionId, action: RevisionAction, fx: &mut Vec<Effect>) {
        let known = self
            .store
            .peek(path)
            .is_some_and(|s| s.history_loaded() && s.all().contains_key(&id));
        if known {
            self.request_reconstruct(path, id, action, fx);
        } else {
            fx.push(Effect::Transport(TransportCommand::GetRevisionHistory {
                path: path.clone(),
                id: Some(id),
                next_action: Some(action.into()),
            }));
        }
    }

    /// Ask the diff process for the exact content of `target`. In the
    /// compact view a grouped id is expanded to its members; the history
    /// sent is always the raw one.
    fn request_reconstruct(&mut self, path: &DocPath, target: RevisionId, action: RevisionAction, fx: &mut Vec<Effect>) {
        let rule = self.store.rule();
        let Some(state) = self.store.peek_mut(path) else {
            return;
        };
        if !state.all().contains_key(&target) {
            log::warn!("Revision {target} of {path} is not in its history");
            return;
        }

        let group = if state.use_compact_view() {
            state
                .compact_view(rule)
                .group_of(target)
                .filter(|group| group.len() > 1)
                .map(<[RevisionId]>::to_vec)
                .unwrap_or_else(|| vec![target])
        } else {
            vec![target]
        };
        let history: Vec<RevisionRecord> = state.all().values().cloned().collect();

        let request = self.next_request_id();
        self.outstanding.insert(
            request,
            Outstanding::Reconstruct {
                path: path.clone(),
                target,
                action,
            },
        );
        fx.push(Effect::Diff(DiffRequest::Reconstruct {
            request,
            path: path.clone(),
            target,
            group,
            history,
            action,
        }));
    }

    fn on_reconstructed(
        &mut self,
        path: &DocPath,
        target: RevisionId,
        action: RevisionAction,
        content: String,
        ranges: Vec<DiffRange>,
        fx: &mut Vec<Effect>,
    ) {
        let Some(state) = self.store.peek_mut(path) else {
            return;
        };
        match action {
            RevisionAction::Preview => {
                state.cache_preview(
                    target,
                    PreviewEntry {
                        content: content.clone(),
                        ranges: ranges.clone(),
                    },
                );
                fx.push(Effect::Notify(Notice::Preview {
                    path: path.clone(),
                    id: target,
                    content,
                    ranges,
                }));
            }
            RevisionAction::Apply => {
                fx.push(Effect::ReplaceContent {
                    path: path.clone(),
                    content: content.clone(),
                });
                self.save(path, SaveRequest::new(content).silent(true).restoring(target), fx);
            }
        }
    }
}

impl std::fmt::Debug for SyncProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProtocol")
            .field("online", &self.online)
            .field("autosave", &self.autosave)
            .field("documents", &self.store.len())
            .field("offline", &self.offline.len())
            .field("outstanding", &self.outstanding.len())
            .field("replay", &self.replay)
            .finish_non_exhaustive()
    }
}
