//! Revision records and the identifiers they are keyed by.
//!
//! A revision is one committed save of a document. Its id is a millisecond
//! timestamp, unique within the document, and doubles as the ordering key.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Millisecond timestamp identifying a revision within its document.
pub type RevisionId = u64;

/// Workspace-relative document path.
///
/// Leading slashes are stripped so `/src/a.txt` and `src/a.txt` address the
/// same revision history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocPath(String);

impl DocPath {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        if path.starts_with('/') {
            Self(path.trim_start_matches('/').to_string())
        } else {
            Self(path)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `self` lies inside the folder `folder`.
    pub fn is_within(&self, folder: &DocPath) -> bool {
        self.0
            .strip_prefix(folder.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl From<&str> for DocPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for DocPath {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque diff payload produced by the diff process.
///
/// The engine never interprets patches. It only relies on them being
/// order-preserving and concatenable, which is what lets a compacted group
/// carry the ordered list of its members' patches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch(String);

impl Patch {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One committed save.
///
/// Records are never mutated once stored; state changes such as
/// confirmation produce a replacement value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub id: RevisionId,
    /// One payload for a raw revision, the members' payloads in order for a
    /// compacted group.
    pub patch: Vec<Patch>,
    /// Contributor identifiers, de-duplicated, in first-seen order.
    pub contributors: Vec<String>,
    /// Automatic/background save.
    pub silent: bool,
    /// Earlier revision this one restores.
    pub restoring: Option<RevisionId>,
    /// Acknowledged by the server.
    pub confirmed: bool,
}

impl RevisionRecord {
    pub fn new(id: RevisionId, patch: Vec<Patch>) -> Self {
        Self {
            id,
            patch,
            contributors: Vec::new(),
            silent: false,
            restoring: None,
            confirmed: false,
        }
    }

    pub fn with_contributors<I, S>(mut self, contributors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let incoming: Vec<String> = contributors.into_iter().map(Into::into).collect();
        merge_contributors(&mut self.contributors, &incoming);
        self
    }

    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn with_restoring(mut self, restoring: Option<RevisionId>) -> Self {
        self.restoring = restoring;
        self
    }

    /// Replacement value marked as acknowledged by the server.
    pub fn confirmed(self) -> Self {
        Self {
            confirmed: true,
            ..self
        }
    }

    pub fn is_restoring(&self) -> bool {
        self.restoring.is_some()
    }

    /// False when every payload is empty (the save changed nothing).
    pub fn has_changes(&self) -> bool {
        self.patch.iter().any(|p| !p.is_empty())
    }
}

/// Union `incoming` into `into`, keeping first-seen order.
pub fn merge_contributors(into: &mut Vec<String>, incoming: &[String]) {
    for contributor in incoming {
        if !into.iter().any(|c| c == contributor) {
            into.push(contributor.clone());
        }
    }
}
