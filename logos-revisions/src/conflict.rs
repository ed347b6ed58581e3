//! External-change conflict resolution.
//!
//! ```text
//! ExternalChange ─► autosave off ─► getRealFileContents ─► RecoveryJudgment
//!                                                             │
//!                     ┌───────────── StoreAsRevision ◄────────┤
//!                     │                                       ▼
//!                     │                            NeedsUserDecision ─► ConflictPrompt
//!                     │                                   │ Reload          │ Keep
//!                     ▼                                   ▼                 ▼
//!               store revision              replace + forced save   fetch again, store only
//!                     └──────────────► finish: restore autosave ◄───────────┘
//! ```
//!
//! Autosave is switched off before the first server round trip so no local
//! write races the resolution, and restored only once every changed
//! document has been resolved.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::engine::{DocumentSurface, Effect, Notice};
use crate::error::RevisionError;
use crate::protocol::{NextAction, TransportCommand};
use crate::revision::DocPath;
use crate::sync::{SaveRequest, SyncProtocol};
use crate::worker::{DiffRequest, DiffResponse, RecoveryDecision, RecoveryMode, RequestId};

/// The user's answer to a conflict prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictChoice {
    /// Discard local edits and take the server content.
    Reload,
    /// Keep local content; the server content is only stored in history.
    Keep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    AwaitingServer,
    AwaitingJudgment,
    AwaitingDecision { server_content: String },
}

#[derive(Debug, Clone)]
struct Judgment {
    path: DocPath,
    mode: RecoveryMode,
    server_content: String,
}

#[derive(Debug, Default)]
pub struct ConflictResolver {
    /// Autosave flag from before the first unresolved conflict.
    prior_autosave: Option<bool>,
    /// Paths changed outside the editor and not yet decided.
    changed: BTreeSet<DocPath>,
    resolving: HashMap<DocPath, Phase>,
    judgments: HashMap<RequestId, Judgment>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_resolving(&self, path: &DocPath) -> bool {
        self.resolving.contains_key(path)
    }

    /// Waiting for the user to pick reload or keep.
    pub fn awaiting_decision(&self, path: &DocPath) -> bool {
        matches!(self.resolving.get(path), Some(Phase::AwaitingDecision { .. }))
    }

    pub fn changed(&self) -> impl Iterator<Item = &DocPath> {
        self.changed.iter()
    }

    /// Whether a diff response belongs to a recovery judgment.
    pub fn owns(&self, request: RequestId) -> bool {
        self.judgments.contains_key(&request)
    }

    pub(crate) fn on_external_change(&mut self, path: &DocPath, sync: &mut SyncProtocol, fx: &mut Vec<Effect>) {
        if !sync.arbiter().may_write(path) {
            log::debug!("External change of {path} left to the session master");
            return;
        }

        if self.prior_autosave.is_none() {
            self.prior_autosave = Some(sync.autosave());
        }
        if sync.autosave() {
            sync.set_autosave(false);
            fx.push(Effect::Notify(Notice::AutosaveChanged { enabled: false }));
        }
        self.changed.insert(path.clone());

        if self.resolving.contains_key(path) {
            log::debug!("Already resolving {path}");
            return;
        }
        log::info!("{path} changed outside the editor, fetching server content");
        self.resolving.insert(path.clone(), Phase::AwaitingServer);
        fx.push(Effect::Transport(TransportCommand::GetRealFileContents {
            path: path.clone(),
            next_action: None,
        }));
    }

    pub(crate) fn on_real_file_contents(
        &mut self,
        path: &DocPath,
        contents: String,
        next_action: Option<NextAction>,
        sync: &mut SyncProtocol,
        surface: &dyn DocumentSurface,
        fx: &mut Vec<Effect>,
    ) {
        let mode = if next_action == Some(NextAction::StoreAsRevision) {
            RecoveryMode::StoreOnly
        } else {
            RecoveryMode::Judge
        };
        if !sync.store().contains(path) {
            log::debug!("Dropping server content of closed {path}");
            if mode == RecoveryMode::Judge && self.resolving.get(path) == Some(&Phase::AwaitingServer) {
                self.finish(path, sync, fx);
            }
            return;
        }
        if mode == RecoveryMode::Judge {
            if self.resolving.get(path) != Some(&Phase::AwaitingServer) {
                log::debug!("Unexpected server content for {path}, ignoring");
                return;
            }
            self.resolving.insert(path.clone(), Phase::AwaitingJudgment);
        }

        let base = sync
            .store()
            .peek(path)
            .map(|state| state.base_records())
            .unwrap_or_default();
        let request = sync.next_request_id();
        self.judgments.insert(
            request,
            Judgment {
                path: path.clone(),
                mode,
                server_content: contents.clone(),
            },
        );
        fx.push(Effect::Diff(DiffRequest::RecoveryJudgment {
            request,
            path: path.clone(),
            base,
            local_content: surface.content(path).unwrap_or_default(),
            server_content: contents,
            mode,
        }));
    }

    pub(crate) fn on_diff(&mut self, response: DiffResponse, sync: &mut SyncProtocol, fx: &mut Vec<Effect>) {
        let Some(judgment) = self.judgments.remove(&response.request()) else {
            return;
        };
        let Judgment {
            path,
            mode,
            server_content,
        } = judgment;

        match response {
            DiffResponse::Recovery {
                decision,
                final_content,
                patch,
                ..
            } => match (mode, decision) {
                (RecoveryMode::StoreOnly, _) => {
                    log::debug!("Storing server content of {path} as a revision");
                    sync.store_recovered(&path, patch, server_content, fx);
                }
                (RecoveryMode::Judge, RecoveryDecision::StoreAsRevision) => {
                    let content = final_content.unwrap_or(server_content);
                    log::info!("Recovered {path} without asking");
                    fx.push(Effect::ReplaceContent {
                        path: path.clone(),
                        content: content.clone(),
                    });
                    sync.store_recovered(&path, patch, content, fx);
                    self.finish(&path, sync, fx);
                }
                (RecoveryMode::Judge, RecoveryDecision::NeedsUserDecision) => {
                    if !self.resolving.contains_key(&path) {
                        log::debug!("Conflict on {path} no longer pending");
                        return;
                    }
                    self.resolving.insert(
                        path.clone(),
                        Phase::AwaitingDecision {
                            server_content: server_content.clone(),
                        },
                    );
                    fx.push(Effect::Notify(Notice::ConflictPrompt {
                        path,
                        server_content,
                    }));
                }
            },
            DiffResponse::Failed { message, .. } => {
                log::warn!("Recovery judgment for {path} failed: {message}");
                fx.push(Effect::Notify(Notice::Degraded(
                    RevisionError::DiffComputationFailure {
                        path: path.clone(),
                        message,
                    },
                )));
                if mode == RecoveryMode::Judge {
                    self.finish(&path, sync, fx);
                }
            }
            other => {
                log::warn!("Unexpected response to recovery judgment for {path}: {other:?}");
                if mode == RecoveryMode::Judge {
                    self.finish(&path, sync, fx);
                }
            }
        }
    }

    pub(crate) fn on_decision(
        &mut self,
        path: &DocPath,
        choice: ConflictChoice,
        sync: &mut SyncProtocol,
        fx: &mut Vec<Effect>,
    ) {
        let server_content = match self.resolving.remove(path) {
            Some(Phase::AwaitingDecision { server_content }) => server_content,
            Some(phase) => {
                log::debug!("Decision for {path} arrived in phase {phase:?}, ignoring");
                self.resolving.insert(path.clone(), phase);
                return;
            }
            None => {
                log::debug!("No conflict pending for {path}");
                return;
            }
        };

        match choice {
            ConflictChoice::Reload => {
                log::info!("Reloading {path} from the server");
                fx.push(Effect::ReplaceContent {
                    path: path.clone(),
                    content: server_content.clone(),
                });
                sync.save(
                    path,
                    SaveRequest::new(server_content).silent(true).force_revision_list(),
                    fx,
                );
            }
            ConflictChoice::Keep => {
                log::info!("Keeping local content of {path}");
                fx.push(Effect::Transport(TransportCommand::GetRealFileContents {
                    path: path.clone(),
                    next_action: Some(NextAction::StoreAsRevision),
                }));
            }
        }
        self.finish(path, sync, fx);
    }

    /// The server could not deliver the content; give up on this conflict.
    pub(crate) fn on_fetch_failed(&mut self, path: &DocPath, sync: &mut SyncProtocol, fx: &mut Vec<Effect>) {
        if self.resolving.get(path) == Some(&Phase::AwaitingServer) {
            log::warn!("Could not fetch server content of {path}");
            self.finish(path, sync, fx);
        }
    }

    /// A user change of the autosave setting during a conflict takes effect
    /// once the conflict is resolved.
    pub(crate) fn set_autosave(&mut self, enabled: bool, sync: &mut SyncProtocol, fx: &mut Vec<Effect>) {
        if self.prior_autosave.is_some() {
            self.prior_autosave = Some(enabled);
            return;
        }
        if sync.autosave() != enabled {
            sync.set_autosave(enabled);
            fx.push(Effect::Notify(Notice::AutosaveChanged { enabled }));
        }
    }

    /// The document was closed or removed.
    pub(crate) fn forget(&mut self, path: &DocPath, is_folder: bool, sync: &mut SyncProtocol, fx: &mut Vec<Effect>) {
        let matches = |p: &DocPath| p == path || (is_folder && p.is_within(path));
        let affected: Vec<DocPath> = self.changed.iter().filter(|p| matches(*p)).cloned().collect();
        self.judgments.retain(|_, j| !matches(&j.path));
        for p in affected {
            self.finish(&p, sync, fx);
        }
    }

    pub(crate) fn rename(&mut self, from: &DocPath, to: &DocPath) {
        if self.changed.remove(from) {
            self.changed.insert(to.clone());
        }
        if let Some(phase) = self.resolving.remove(from) {
            self.resolving.insert(to.clone(), phase);
        }
        for judgment in self.judgments.values_mut() {
            if &judgment.path == from {
                judgment.path = to.clone();
            }
        }
    }

    fn finish(&mut self, path: &DocPath, sync: &mut SyncProtocol, fx: &mut Vec<Effect>) {
        self.resolving.remove(path);
        self.changed.remove(path);
        if !self.changed.is_empty() {
            return;
        }
        if let Some(prior) = self.prior_autosave.take() {
            if sync.autosave() != prior {
                sync.set_autosave(prior);
                fx.push(Effect::Notify(Notice::AutosaveChanged { enabled: prior }));
            }
        }
    }
}
