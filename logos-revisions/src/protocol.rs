//! Transport commands and server messages.
//!
//! Wire format (bincode-encoded, one frame per message):
//! ```text
//! ┌──────────┬──────────┬───────────────────────────────┐
//! │ session  │ seq      │ body                          │
//! │ 16 bytes │ varint   │ TransportCommand / ServerMsg  │
//! └──────────┴──────────┴───────────────────────────────┘
//! ```
//!
//! Commands are fire-and-forget. The server answers asynchronously and the
//! engine correlates replies purely by path and revision id, so replies may
//! arrive out of order, twice, or never.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::revision::{DocPath, RevisionId, RevisionRecord};
use crate::worker::RevisionAction;

/// Follow-up the server echoes back with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextAction {
    Preview,
    Apply,
    StoreAsRevision,
}

impl NextAction {
    pub fn revision_action(self) -> Option<RevisionAction> {
        match self {
            Self::Preview => Some(RevisionAction::Preview),
            Self::Apply => Some(RevisionAction::Apply),
            Self::StoreAsRevision => None,
        }
    }
}

impl From<RevisionAction> for NextAction {
    fn from(action: RevisionAction) -> Self {
        match action {
            RevisionAction::Preview => Self::Preview,
            RevisionAction::Apply => Self::Apply,
        }
    }
}

/// Commands sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportCommand {
    SaveRevision {
        path: DocPath,
        revision: RevisionRecord,
        /// Ask the server to answer with the full revision list.
        force_revision_list: bool,
    },
    GetRevisionHistory {
        path: DocPath,
        id: Option<RevisionId>,
        next_action: Option<NextAction>,
    },
    GetRealFileContents {
        path: DocPath,
        next_action: Option<NextAction>,
    },
    RemoveRevision {
        path: DocPath,
        is_folder: bool,
    },
    MoveRevision {
        path: DocPath,
        new_path: DocPath,
    },
}

impl TransportCommand {
    pub fn path(&self) -> &DocPath {
        match self {
            Self::SaveRevision { path, .. }
            | Self::GetRevisionHistory { path, .. }
            | Self::GetRealFileContents { path, .. }
            | Self::RemoveRevision { path, .. }
            | Self::MoveRevision { path, .. } => path,
        }
    }

    /// Server-side method name, as echoed in `ServerError::from_method`.
    pub fn method(&self) -> &'static str {
        match self {
            Self::SaveRevision { .. } => "saveRevision",
            Self::GetRevisionHistory { .. } => "getRevisionHistory",
            Self::GetRealFileContents { .. } => "getRealFileContents",
            Self::RemoveRevision { .. } => "removeRevision",
            Self::MoveRevision { .. } => "moveRevision",
        }
    }
}

/// Messages delivered by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    ConfirmSave {
        path: DocPath,
        id: RevisionId,
    },
    RevisionHistory {
        path: DocPath,
        revisions: Option<Vec<RevisionRecord>>,
        id: Option<RevisionId>,
        next_action: Option<NextAction>,
    },
    RealFileContents {
        path: DocPath,
        contents: String,
        next_action: Option<NextAction>,
    },
    ServerError {
        from_method: String,
        message: String,
        path: Option<DocPath>,
        id: Option<RevisionId>,
    },
}

/// One framed message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame<T> {
    /// Engine instance that sent (or is addressed by) this frame.
    pub session: Uuid,
    /// Per-session sequence number.
    pub seq: u64,
    pub body: T,
}

impl<T: Serialize + DeserializeOwned> Frame<T> {
    pub fn new(session: Uuid, seq: u64, body: T) -> Self {
        Self { session, seq, body }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("engine has shut down")]
    EngineStopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::Patch;

    #[test]
    fn test_save_frame_roundtrip() {
        let session = Uuid::new_v4();
        let revision = RevisionRecord::new(1_700_000_000_000, vec![Patch::new("@@ -1 +1 @@")])
            .with_contributors(["alice@example.com"])
            .with_restoring(Some(1_600_000_000_000));
        let command = TransportCommand::SaveRevision {
            path: DocPath::new("src/main.rs"),
            revision: revision.clone(),
            force_revision_list: false,
        };

        let bytes = Frame::new(session, 3, command.clone()).encode().unwrap();
        let decoded = Frame::<TransportCommand>::decode(&bytes).unwrap();

        assert_eq!(decoded.session, session);
        assert_eq!(decoded.seq, 3);
        assert_eq!(decoded.body, command);
    }

    #[test]
    fn test_history_preserves_revision_order() {
        let revisions: Vec<RevisionRecord> = (0..20)
            .map(|i| RevisionRecord::new(i * 10, vec![Patch::new(format!("p{i}"))]))
            .collect();
        let message = ServerMessage::RevisionHistory {
            path: DocPath::new("a.txt"),
            revisions: Some(revisions.clone()),
            id: Some(50),
            next_action: Some(NextAction::Preview),
        };

        let bytes = Frame::new(Uuid::nil(), 0, message).encode().unwrap();
        match Frame::<ServerMessage>::decode(&bytes).unwrap().body {
            ServerMessage::RevisionHistory { revisions: Some(decoded), .. } => {
                assert_eq!(decoded, revisions);
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            Frame::<ServerMessage>::decode(&garbage),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_method_names() {
        let path = DocPath::new("a.txt");
        let history = TransportCommand::GetRevisionHistory {
            path: path.clone(),
            id: None,
            next_action: None,
        };
        let moved = TransportCommand::MoveRevision {
            path: path.clone(),
            new_path: DocPath::new("b.txt"),
        };
        assert_eq!(history.method(), "getRevisionHistory");
        assert_eq!(moved.method(), "moveRevision");
        assert_eq!(moved.path(), &path);
    }

    #[test]
    fn test_next_action_mapping() {
        assert_eq!(NextAction::Preview.revision_action(), Some(RevisionAction::Preview));
        assert_eq!(NextAction::StoreAsRevision.revision_action(), None);
        assert_eq!(NextAction::from(RevisionAction::Apply), NextAction::Apply);
    }
}
