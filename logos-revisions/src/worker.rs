//! Diff process host.
//!
//! The diff process is an isolated worker reached only by message passing.
//! It runs on tokio's blocking pool behind a bounded mailbox; responses
//! come back on a channel in the order the worker produced them.
//!
//! ```text
//! RevisionEngine ──DiffRequest──► [mailbox] ──► DiffWorker task ──► DiffBackend
//!       ▲                                              │
//!       └──────────────────DiffResponse────────────────┘
//! ```
//!
//! The engine never computes diffs itself; a [`DiffBackend`] does.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::revision::{DocPath, Patch, RevisionId, RevisionRecord};

/// Correlation id for one request to the diff process.
pub type RequestId = u64;

/// What to do with reconstructed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevisionAction {
    Preview,
    Apply,
}

/// How a recovery request should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryMode {
    /// Decide whether the user has to be asked.
    Judge,
    /// Only produce a revision of the server content.
    StoreOnly,
}

/// Outcome of a recovery judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryDecision {
    StoreAsRevision,
    NeedsUserDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeKind {
    Insert,
    Delete,
}

/// A changed span in reconstructed content, for highlighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRange {
    pub start_row: u32,
    pub start_col: u32,
    pub end_row: u32,
    pub end_col: u32,
    pub kind: RangeKind,
}

/// Requests sent to the diff process. Every request names its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffRequest {
    /// Patch from the content described by `base` to `content`.
    ComputeDiff {
        request: RequestId,
        path: DocPath,
        base: Vec<RevisionRecord>,
        content: String,
    },
    /// Content of `target`, replaying `history` (always the raw revisions).
    /// `group` lists the original ids `target` stands for in a compacted view.
    Reconstruct {
        request: RequestId,
        path: DocPath,
        target: RevisionId,
        group: Vec<RevisionId>,
        history: Vec<RevisionRecord>,
        action: RevisionAction,
    },
    RecoveryJudgment {
        request: RequestId,
        path: DocPath,
        base: Vec<RevisionRecord>,
        local_content: String,
        server_content: String,
        mode: RecoveryMode,
    },
    /// The document was closed; cached bases may be dropped.
    CloseFile { path: DocPath },
}

impl DiffRequest {
    pub fn request(&self) -> Option<RequestId> {
        match self {
            Self::ComputeDiff { request, .. }
            | Self::Reconstruct { request, .. }
            | Self::RecoveryJudgment { request, .. } => Some(*request),
            Self::CloseFile { .. } => None,
        }
    }

    pub fn path(&self) -> &DocPath {
        match self {
            Self::ComputeDiff { path, .. }
            | Self::Reconstruct { path, .. }
            | Self::RecoveryJudgment { path, .. }
            | Self::CloseFile { path } => path,
        }
    }
}

/// Responses from the diff process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffResponse {
    Patch {
        request: RequestId,
        path: DocPath,
        patch: Vec<Patch>,
    },
    Reconstructed {
        request: RequestId,
        path: DocPath,
        target: RevisionId,
        content: String,
        ranges: Vec<DiffRange>,
    },
    Recovery {
        request: RequestId,
        path: DocPath,
        decision: RecoveryDecision,
        /// Content the document should hold once stored.
        final_content: Option<String>,
        /// Patch from the known history to the server content.
        patch: Vec<Patch>,
    },
    Failed {
        request: RequestId,
        path: DocPath,
        message: String,
    },
}

impl DiffResponse {
    pub fn request(&self) -> RequestId {
        match self {
            Self::Patch { request, .. }
            | Self::Reconstructed { request, .. }
            | Self::Recovery { request, .. }
            | Self::Failed { request, .. } => *request,
        }
    }

    pub fn path(&self) -> &DocPath {
        match self {
            Self::Patch { path, .. }
            | Self::Reconstructed { path, .. }
            | Self::Recovery { path, .. }
            | Self::Failed { path, .. } => path,
        }
    }
}

/// Failure reported by a [`DiffBackend`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct BackendError(pub String);

/// Result of [`DiffBackend::recovery_judgment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryVerdict {
    pub decision: RecoveryDecision,
    pub final_content: Option<String>,
    pub patch: Vec<Patch>,
}

/// The diff/patch implementation living inside the worker.
pub trait DiffBackend: Send + 'static {
    fn compute_diff(
        &mut self,
        path: &DocPath,
        base: &[RevisionRecord],
        content: &str,
    ) -> Result<Vec<Patch>, BackendError>;

    fn reconstruct(
        &mut self,
        path: &DocPath,
        target: RevisionId,
        group: &[RevisionId],
        history: &[RevisionRecord],
    ) -> Result<(String, Vec<DiffRange>), BackendError>;

    fn recovery_judgment(
        &mut self,
        path: &DocPath,
        base: &[RevisionRecord],
        local_content: &str,
        server_content: &str,
        mode: RecoveryMode,
    ) -> Result<RecoveryVerdict, BackendError>;

    fn close_file(&mut self, _path: &DocPath) {}
}

/// Run one request through `backend`. `CloseFile` produces no response.
pub fn process<B: DiffBackend + ?Sized>(backend: &mut B, request: DiffRequest) -> Option<DiffResponse> {
    let failed = |request, path, e: BackendError| DiffResponse::Failed {
        request,
        path,
        message: e.to_string(),
    };

    let response = match request {
        DiffRequest::ComputeDiff {
            request,
            path,
            base,
            content,
        } => match backend.compute_diff(&path, &base, &content) {
            Ok(patch) => DiffResponse::Patch {
                request,
                path,
                patch,
            },
            Err(e) => failed(request, path, e),
        },
        DiffRequest::Reconstruct {
            request,
            path,
            target,
            group,
            history,
            ..
        } => match backend.reconstruct(&path, target, &group, &history) {
            Ok((content, ranges)) => DiffResponse::Reconstructed {
                request,
                path,
                target,
                content,
                ranges,
            },
            Err(e) => failed(request, path, e),
        },
        DiffRequest::RecoveryJudgment {
            request,
            path,
            base,
            local_content,
            server_content,
            mode,
        } => match backend.recovery_judgment(&path, &base, &local_content, &server_content, mode) {
            Ok(verdict) => DiffResponse::Recovery {
                request,
                path,
                decision: verdict.decision,
                final_content: verdict.final_content,
                patch: verdict.patch,
            },
            Err(e) => failed(request, path, e),
        },
        DiffRequest::CloseFile { path } => {
            backend.close_file(&path);
            return None;
        }
    };
    Some(response)
}

/// Mailbox errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("diff worker mailbox is full")]
    MailboxFull,
    #[error("diff worker has stopped")]
    Closed,
}

/// Handle to the spawned diff worker task.
pub struct DiffWorker {
    mailbox: mpsc::Sender<DiffRequest>,
    task: JoinHandle<()>,
}

impl DiffWorker {
    /// Spawn the worker on the current tokio runtime.
    ///
    /// Returns the handle and the receiver on which responses arrive.
    pub fn spawn<B: DiffBackend>(mut backend: B, capacity: usize) -> (Self, mpsc::Receiver<DiffResponse>) {
        let (mailbox, mut requests) = mpsc::channel::<DiffRequest>(capacity.max(1));
        let (responses_tx, responses) = mpsc::channel::<DiffResponse>(capacity.max(1));

        // Diffing is CPU-bound; keep it off the async worker threads.
        let task = tokio::task::spawn_blocking(move || {
            while let Some(request) = requests.blocking_recv() {
                log::trace!("Diff worker: {:?} for {}", request.request(), request.path());
                if let Some(response) = process(&mut backend, request) {
                    if responses_tx.blocking_send(response).is_err() {
                        break;
                    }
                }
            }
            log::debug!("Diff worker stopped");
        });

        (Self { mailbox, task }, responses)
    }

    /// Post a request without waiting. A full mailbox is reported rather
    /// than awaited so the caller never blocks on the worker.
    pub fn submit(&self, request: DiffRequest) -> Result<(), WorkerError> {
        self.mailbox.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => WorkerError::MailboxFull,
            TrySendError::Closed(_) => WorkerError::Closed,
        })
    }

    /// Close the mailbox and wait for in-flight requests to drain.
    pub async fn shutdown(self) {
        drop(self.mailbox);
        if let Err(e) = self.task.await {
            log::warn!("Diff worker task ended abnormally: {e}");
        }
    }
}
