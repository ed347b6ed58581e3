//! Failure taxonomy of the revision engine.
//!
//! None of these is fatal. Each one degrades to a retry on the next trigger,
//! a resync, or a logged warning surfaced as [`crate::Notice::Degraded`].

use thiserror::Error;

use crate::revision::{DocPath, RevisionId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RevisionError {
    /// Retried implicitly by the next qualifying edit.
    #[error("diff computation failed for {path}: {message}")]
    DiffComputationFailure { path: DocPath, message: String },

    /// The save was routed to the offline queue.
    #[error("transport unavailable, save of {path} queued offline")]
    TransportUnavailable { path: DocPath },

    /// The offline queue is at capacity; the save was dropped.
    #[error("offline queue full, save of {path} dropped")]
    OfflineQueueFull { path: DocPath },

    /// The record stays pending; it is not resent automatically.
    #[error("server rejected {method}{}: {message}", for_path(.path))]
    ServerRejection {
        method: String,
        path: Option<DocPath>,
        id: Option<RevisionId>,
        message: String,
    },

    /// Local pending saves and server state diverged; history is refetched.
    #[error("state desync on {path}: confirmation for unknown revision {id}")]
    StateDesync { path: DocPath, id: RevisionId },

    /// The persisted offline queue could not be read and was reset.
    #[error("offline queue snapshot is corrupt: {0}")]
    PersistenceCorruption(String),
}

fn for_path(path: &Option<DocPath>) -> String {
    path.as_ref().map(|p| format!(" for {p}")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let desync = RevisionError::StateDesync {
            path: DocPath::new("a.txt"),
            id: 500,
        };
        assert_eq!(
            desync.to_string(),
            "state desync on a.txt: confirmation for unknown revision 500"
        );

        let rejection = RevisionError::ServerRejection {
            method: "saveRevision".into(),
            path: Some(DocPath::new("b.txt")),
            id: Some(7),
            message: "disk full".into(),
        };
        assert_eq!(rejection.to_string(), "server rejected saveRevision for b.txt: disk full");

        let anonymous = RevisionError::ServerRejection {
            method: "moveRevision".into(),
            path: None,
            id: None,
            message: "denied".into(),
        };
        assert_eq!(anonymous.to_string(), "server rejected moveRevision: denied");

        let full = RevisionError::OfflineQueueFull {
            path: DocPath::new("c.txt"),
        };
        assert_eq!(full.to_string(), "offline queue full, save of c.txt dropped");
    }
}
