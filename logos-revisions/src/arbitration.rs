//! Collaboration arbitration.
//!
//! In a collaborative session several editors share one document, but only
//! the master's saves become revisions. Who the master is gets decided
//! elsewhere; the engine only asks through [`Arbiter`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::revision::DocPath;

/// Decides whether this participant may write revisions for a document.
pub trait Arbiter: Send {
    /// The document is shared in a collaborative session.
    fn is_collaborative(&self, path: &DocPath) -> bool;

    /// This participant is the session master for the document.
    fn is_master(&self, path: &DocPath) -> bool;

    /// Saves, recoveries and external-change fetches are only done by
    /// single users or the master.
    fn may_write(&self, path: &DocPath) -> bool {
        !self.is_collaborative(path) || self.is_master(path)
    }
}

/// No collaboration at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleUser;

impl Arbiter for SingleUser {
    fn is_collaborative(&self, _path: &DocPath) -> bool {
        false
    }

    fn is_master(&self, _path: &DocPath) -> bool {
        true
    }
}

/// Every document is collaborative and this participant always claims the
/// master role.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeMaster;

impl Arbiter for AssumeMaster {
    fn is_collaborative(&self, _path: &DocPath) -> bool {
        true
    }

    fn is_master(&self, _path: &DocPath) -> bool {
        true
    }
}

/// Role in a collaborative session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Participant,
}

/// Explicit per-document roles, updated by the host as sessions change.
///
/// Clones share the role table, so the host keeps one clone and hands
/// another to the engine.
#[derive(Debug, Clone, Default)]
pub struct SessionArbiter {
    roles: Arc<RwLock<HashMap<DocPath, Role>>>,
}

impl SessionArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join (or change role in) a session for `path`.
    pub fn set_role(&self, path: DocPath, role: Role) {
        match self.roles.write() {
            Ok(mut roles) => {
                roles.insert(path, role);
            }
            Err(_) => log::error!("Session role table poisoned, ignoring role change"),
        }
    }

    /// Leave the session for `path`.
    pub fn clear_role(&self, path: &DocPath) {
        if let Ok(mut roles) = self.roles.write() {
            roles.remove(path);
        }
    }

    pub fn role(&self, path: &DocPath) -> Option<Role> {
        self.roles.read().ok().and_then(|roles| roles.get(path).copied())
    }
}

impl Arbiter for SessionArbiter {
    fn is_collaborative(&self, path: &DocPath) -> bool {
        self.role(path).is_some()
    }

    fn is_master(&self, path: &DocPath) -> bool {
        self.role(path) == Some(Role::Master)
    }
}
