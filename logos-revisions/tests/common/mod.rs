//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use logos_revisions::{
    process, BackendError, DiffBackend, DiffRange, DiffRequest, DocPath, DocumentSurface, Effect,
    EngineConfig, EngineEvent, ManualClock, MemoryQueueStore, OfflineQueue, Patch,
    RecoveryDecision, RecoveryMode, RecoveryVerdict, RevisionEngine, RevisionId, RevisionRecord,
    ServerMessage, SingleUser, TransportCommand,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ─── Document surface ────────────────────────────────────────────────────────

#[derive(Default)]
struct Docs {
    contents: HashMap<DocPath, String>,
    new_files: HashSet<DocPath>,
    clean: HashSet<DocPath>,
    active: Option<DocPath>,
}

/// In-memory editor. Clones share the same documents, so a test can keep
/// one while the runtime owns another.
#[derive(Clone, Default)]
pub struct FakeSurface {
    docs: Arc<Mutex<Docs>>,
}

impl FakeSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: &str, content: &str) {
        let mut docs = self.docs.lock().unwrap();
        let path = DocPath::new(path);
        docs.clean.remove(&path);
        if docs.active.is_none() {
            docs.active = Some(path.clone());
        }
        docs.contents.insert(path, content.to_string());
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.docs.lock().unwrap().contents.get(&DocPath::new(path)).cloned()
    }

    pub fn mark_new(&self, path: &str) {
        self.docs.lock().unwrap().new_files.insert(DocPath::new(path));
    }

    pub fn mark_clean(&self, path: &str) {
        self.docs.lock().unwrap().clean.insert(DocPath::new(path));
    }

    pub fn activate(&self, path: &str) {
        self.docs.lock().unwrap().active = Some(DocPath::new(path));
    }
}

impl DocumentSurface for FakeSurface {
    fn content(&self, path: &DocPath) -> Option<String> {
        self.docs.lock().unwrap().contents.get(path).cloned()
    }

    fn is_dirty(&self, path: &DocPath) -> bool {
        !self.docs.lock().unwrap().clean.contains(path)
    }

    fn is_new_file(&self, path: &DocPath) -> bool {
        self.docs.lock().unwrap().new_files.contains(path)
    }

    fn active_document(&self) -> Option<DocPath> {
        self.docs.lock().unwrap().active.clone()
    }
}

// ─── Diff backend ────────────────────────────────────────────────────────────

/// Backend whose patches are whole-content snapshots prefixed with `=`.
///
/// Concatenating snapshots keeps the last one authoritative, so grouped
/// patches still describe the group's final content.
#[derive(Default)]
pub struct SnapshotBackend {
    pub computed: Arc<Mutex<Vec<(DocPath, Vec<RevisionId>, String)>>>,
}

pub fn content_at(history: &[RevisionRecord], target: RevisionId) -> Option<String> {
    history
        .iter()
        .filter(|r| r.id <= target)
        .flat_map(|r| r.patch.iter())
        .filter(|p| !p.is_empty())
        .last()
        .map(|p| p.as_str().trim_start_matches('=').to_string())
}

impl DiffBackend for SnapshotBackend {
    fn compute_diff(
        &mut self,
        path: &DocPath,
        base: &[RevisionRecord],
        content: &str,
    ) -> Result<Vec<Patch>, BackendError> {
        if let Ok(mut computed) = self.computed.lock() {
            computed.push((path.clone(), base.iter().map(|r| r.id).collect(), content.to_string()));
        }
        if content.contains("<<boom>>") {
            return Err(BackendError("unparseable content".into()));
        }
        let current = base.last().and_then(|r| content_at(base, r.id));
        if current.as_deref() == Some(content) {
            Ok(vec![Patch::default()])
        } else {
            Ok(vec![Patch::new(format!("={content}"))])
        }
    }

    fn reconstruct(
        &mut self,
        _path: &DocPath,
        target: RevisionId,
        _group: &[RevisionId],
        history: &[RevisionRecord],
    ) -> Result<(String, Vec<DiffRange>), BackendError> {
        content_at(history, target)
            .map(|content| (content, Vec::new()))
            .ok_or_else(|| BackendError(format!("no content for revision {target}")))
    }

    fn recovery_judgment(
        &mut self,
        _path: &DocPath,
        base: &[RevisionRecord],
        local_content: &str,
        server_content: &str,
        _mode: RecoveryMode,
    ) -> Result<RecoveryVerdict, BackendError> {
        let known = base.last().and_then(|r| content_at(base, r.id));
        let decision = if local_content == server_content || known.as_deref() == Some(local_content) {
            RecoveryDecision::StoreAsRevision
        } else {
            RecoveryDecision::NeedsUserDecision
        };
        Ok(RecoveryVerdict {
            decision,
            final_content: Some(server_content.to_string()),
            patch: vec![Patch::new(format!("={server_content}"))],
        })
    }
}

// ─── Engine harness ──────────────────────────────────────────────────────────

/// Drives a [`RevisionEngine`] synchronously, playing diff process and
/// (optionally) server.
pub struct Harness {
    pub engine: RevisionEngine,
    pub surface: FakeSurface,
    pub clock: ManualClock,
    pub backend: SnapshotBackend,
    pub store: MemoryQueueStore,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::for_testing())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_store(config, MemoryQueueStore::new())
    }

    pub fn with_store(config: EngineConfig, store: MemoryQueueStore) -> Self {
        init_logging();
        let clock = ManualClock::new(1_000);
        let offline = OfflineQueue::open(Box::new(store.clone()), config.offline_queue_capacity);
        let engine = RevisionEngine::new(&config, offline, Box::new(SingleUser), Box::new(clock.clone()));
        Self {
            engine,
            surface: FakeSurface::new(),
            clock,
            backend: SnapshotBackend::default(),
            store,
        }
    }

    pub fn handle(&mut self, event: EngineEvent) -> Vec<Effect> {
        self.engine.handle(event, &self.surface)
    }

    /// Open `path` with `content` and answer the history request with
    /// `history`.
    pub fn open(&mut self, path: &str, content: &str, history: Vec<RevisionRecord>) -> Vec<Effect> {
        self.surface.set(path, content);
        let fx = self.handle(EngineEvent::Opened {
            path: DocPath::new(path),
        });
        assert!(fx.iter().any(|e| matches!(
            e,
            Effect::Transport(TransportCommand::GetRevisionHistory { id: None, .. })
        )));
        self.handle(EngineEvent::Server(ServerMessage::RevisionHistory {
            path: DocPath::new(path),
            revisions: Some(history),
            id: None,
            next_action: None,
        }))
    }

    /// Run every diff request in `fx` through the backend and feed the
    /// responses back, returning the effects they produced.
    pub fn run_diffs(&mut self, fx: &[Effect]) -> Vec<Effect> {
        let mut produced = Vec::new();
        for request in diff_requests(fx) {
            if let Some(response) = process(&mut self.backend, request) {
                produced.extend(self.handle(EngineEvent::Diff(response)));
            }
        }
        produced
    }

    /// Confirm every save in `fx` and return the resulting effects.
    pub fn confirm_saves(&mut self, fx: &[Effect]) -> Vec<Effect> {
        let mut produced = Vec::new();
        for (path, record) in saves(fx) {
            produced.extend(self.handle(EngineEvent::Server(ServerMessage::ConfirmSave {
                path,
                id: record.id,
            })));
        }
        produced
    }
}

// ─── Effect helpers ──────────────────────────────────────────────────────────

pub fn diff_requests(fx: &[Effect]) -> Vec<DiffRequest> {
    fx.iter()
        .filter_map(|e| match e {
            Effect::Diff(request) => Some(request.clone()),
            _ => None,
        })
        .collect()
}

pub fn compute_requests(fx: &[Effect]) -> Vec<(DocPath, Vec<RevisionId>, String)> {
    fx.iter()
        .filter_map(|e| match e {
            Effect::Diff(DiffRequest::ComputeDiff {
                path, base, content, ..
            }) => Some((path.clone(), base.iter().map(|r| r.id).collect(), content.clone())),
            _ => None,
        })
        .collect()
}

pub fn saves(fx: &[Effect]) -> Vec<(DocPath, RevisionRecord)> {
    fx.iter()
        .filter_map(|e| match e {
            Effect::Transport(TransportCommand::SaveRevision { path, revision, .. }) => {
                Some((path.clone(), revision.clone()))
            }
            _ => None,
        })
        .collect()
}

pub fn transport(fx: &[Effect]) -> Vec<TransportCommand> {
    fx.iter()
        .filter_map(|e| match e {
            Effect::Transport(command) => Some(command.clone()),
            _ => None,
        })
        .collect()
}

pub fn revision(id: RevisionId, content: &str) -> RevisionRecord {
    RevisionRecord::new(id, vec![Patch::new(format!("={content}"))]).with_contributors(["alice@example.com"])
}
