//! Per-document revision cache.
//!
//! Holds the raw revisions (`all`, never lossy), the lazily derived compact
//! view, and the transient flags the save lifecycle needs. No I/O happens
//! here.

use std::collections::{BTreeMap, HashMap};

use crate::compaction::{compact, CompactView, GroupingRule};
use crate::revision::{merge_contributors, DocPath, RevisionId, RevisionRecord};
use crate::sync::SaveRequest;
use crate::worker::DiffRange;

/// Reconstructed content for one revision, kept for quick re-display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewEntry {
    pub content: String,
    pub ranges: Vec<DiffRange>,
}

/// Revision state of one open document.
#[derive(Debug, Clone)]
pub struct DocumentRevisionState {
    all: BTreeMap<RevisionId, RevisionRecord>,
    compact: Option<CompactView>,
    use_compact_view: bool,
    history_loaded: bool,
    pending_server_confirm: BTreeMap<RevisionId, RevisionRecord>,
    changed_users: Vec<String>,
    preview_cache: HashMap<RevisionId, PreviewEntry>,

    /// A diff request for this document is outstanding.
    pub(crate) pending_worker_roundtrip: bool,
    /// Bumped on every qualifying edit; stale debounce timers compare against it.
    pub(crate) debounce_generation: u64,
    /// An edit arrived while the diff request was outstanding.
    pub(crate) edited_during_roundtrip: bool,
    /// Explicit save waiting for the outstanding diff request to resolve.
    pub(crate) queued_save: Option<SaveRequest>,
}

impl Default for DocumentRevisionState {
    fn default() -> Self {
        Self {
            all: BTreeMap::new(),
            compact: None,
            use_compact_view: true,
            history_loaded: false,
            pending_server_confirm: BTreeMap::new(),
            changed_users: Vec::new(),
            preview_cache: HashMap::new(),
            pending_worker_roundtrip: false,
            debounce_generation: 0,
            edited_during_roundtrip: false,
            queued_save: None,
        }
    }
}

impl DocumentRevisionState {
    pub fn all(&self) -> &BTreeMap<RevisionId, RevisionRecord> {
        &self.all
    }

    pub fn record(&self, id: RevisionId) -> Option<&RevisionRecord> {
        self.all.get(&id)
    }

    pub fn history_loaded(&self) -> bool {
        self.history_loaded
    }

    /// The server answered without a revision list; nothing to replace.
    pub(crate) fn mark_history_loaded(&mut self) {
        self.history_loaded = true;
    }

    /// Revisions the next diff is computed against: everything committed
    /// plus saves still awaiting confirmation, in id order.
    pub fn base_records(&self) -> Vec<RevisionRecord> {
        let mut merged: BTreeMap<RevisionId, &RevisionRecord> =
            self.all.iter().map(|(id, r)| (*id, r)).collect();
        for (id, record) in &self.pending_server_confirm {
            merged.entry(*id).or_insert(record);
        }
        merged.into_values().cloned().collect()
    }

    pub fn pending_worker_roundtrip(&self) -> bool {
        self.pending_worker_roundtrip
    }

    pub fn pending_server_confirm(&self) -> &BTreeMap<RevisionId, RevisionRecord> {
        &self.pending_server_confirm
    }

    pub fn is_awaiting_confirm(&self, id: RevisionId) -> bool {
        self.pending_server_confirm.contains_key(&id)
    }

    pub(crate) fn add_pending(&mut self, record: RevisionRecord) {
        self.pending_server_confirm.insert(record.id, record);
    }

    pub(crate) fn take_pending(&mut self, id: RevisionId) -> Option<RevisionRecord> {
        self.pending_server_confirm.remove(&id)
    }

    pub fn changed_users(&self) -> &[String] {
        &self.changed_users
    }

    pub(crate) fn note_contributors(&mut self, contributors: &[String]) {
        merge_contributors(&mut self.changed_users, contributors);
    }

    pub(crate) fn take_changed_users(&mut self) -> Vec<String> {
        std::mem::take(&mut self.changed_users)
    }

    pub fn use_compact_view(&self) -> bool {
        self.use_compact_view
    }

    /// Switch between compact and detailed display. Previews rendered for
    /// one view are not valid for the other, so the cache is dropped.
    pub fn set_compact_view(&mut self, enabled: bool) {
        if self.use_compact_view != enabled {
            self.use_compact_view = enabled;
            self.compact = None;
            self.preview_cache.clear();
        }
    }

    pub fn preview(&self, id: RevisionId) -> Option<&PreviewEntry> {
        self.preview_cache.get(&id)
    }

    pub(crate) fn cache_preview(&mut self, id: RevisionId, entry: PreviewEntry) {
        self.preview_cache.insert(id, entry);
    }

    /// Compact view under `rule`, recomputed if it was invalidated.
    pub fn compact_view(&mut self, rule: GroupingRule) -> &CompactView {
        let rule = if self.use_compact_view {
            rule
        } else {
            GroupingRule::disabled()
        };
        let all = &self.all;
        self.compact.get_or_insert_with(|| compact(all, rule))
    }

    /// Records to list, most recent last: the compact view when enabled,
    /// otherwise `all`.
    pub fn display_records(&mut self, rule: GroupingRule) -> Vec<RevisionRecord> {
        if self.use_compact_view {
            self.compact_view(rule).records.values().cloned().collect()
        } else {
            self.all.values().cloned().collect()
        }
    }

    fn insert(&mut self, record: RevisionRecord) {
        self.pending_server_confirm.remove(&record.id);
        self.all.insert(record.id, record);
        self.compact = None;
    }

    /// Replace `all` with an authoritative server history. Pending entries
    /// the server already knows about are reconciled away.
    fn replace_history(&mut self, revisions: Vec<RevisionRecord>) {
        self.all = revisions
            .into_iter()
            .map(|r| (r.id, r.confirmed()))
            .collect();
        let all = &self.all;
        self.pending_server_confirm.retain(|id, _| !all.contains_key(id));
        self.history_loaded = true;
        self.compact = None;
        self.preview_cache.clear();
    }
}

/// In-memory revision cache for every open document.
#[derive(Debug, Clone, Default)]
pub struct RevisionStore {
    docs: HashMap<DocPath, DocumentRevisionState>,
    rule: GroupingRule,
}

impl RevisionStore {
    pub fn new(rule: GroupingRule) -> Self {
        Self {
            docs: HashMap::new(),
            rule,
        }
    }

    pub fn rule(&self) -> GroupingRule {
        self.rule
    }

    /// State for `path`, created with defaults on first access.
    pub fn get(&mut self, path: &DocPath) -> &mut DocumentRevisionState {
        self.docs.entry(path.clone()).or_default()
    }

    pub fn peek(&self, path: &DocPath) -> Option<&DocumentRevisionState> {
        self.docs.get(path)
    }

    pub fn peek_mut(&mut self, path: &DocPath) -> Option<&mut DocumentRevisionState> {
        self.docs.get_mut(path)
    }

    pub fn contains(&self, path: &DocPath) -> bool {
        self.docs.contains_key(path)
    }

    /// Insert a revision into `all` and clear its pending-confirm entry.
    pub fn commit(&mut self, path: &DocPath, record: RevisionRecord) {
        self.get(path).insert(record);
    }

    /// Authoritative history from the server.
    pub fn replace_history(&mut self, path: &DocPath, revisions: Vec<RevisionRecord>) {
        self.get(path).replace_history(revisions);
    }

    pub fn forget(&mut self, path: &DocPath) -> Option<DocumentRevisionState> {
        self.docs.remove(path)
    }

    /// Forget `folder` and every document inside it.
    pub fn forget_folder(&mut self, folder: &DocPath) -> usize {
        let before = self.docs.len();
        self.docs
            .retain(|path, _| path != folder && !path.is_within(folder));
        before - self.docs.len()
    }

    /// Move state to a new key after the document was renamed.
    pub fn rename(&mut self, from: &DocPath, to: &DocPath) -> bool {
        match self.docs.remove(from) {
            Some(state) => {
                self.docs.insert(to.clone(), state);
                true
            }
            None => false,
        }
    }

    pub fn compact_view(&mut self, path: &DocPath) -> Option<&CompactView> {
        let rule = self.rule;
        self.docs.get_mut(path).map(|state| state.compact_view(rule))
    }

    pub fn paths(&self) -> impl Iterator<Item = &DocPath> {
        self.docs.keys()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::Patch;

    fn rev(id: RevisionId) -> RevisionRecord {
        RevisionRecord::new(id, vec![Patch::new(format!("p{id}"))])
    }

    #[test]
    fn test_get_creates_defaults() {
        let mut store = RevisionStore::default();
        let path = DocPath::new("a.txt");
        let state = store.get(&path);

        assert!(state.use_compact_view());
        assert!(state.all().is_empty());
        assert!(!state.pending_worker_roundtrip());
        assert!(!state.history_loaded());
        assert!(store.contains(&path));
    }

    #[test]
    fn test_commit_clears_pending_and_invalidates_compact() {
        let mut store = RevisionStore::default();
        let path = DocPath::new("a.txt");
        store.get(&path).add_pending(rev(5));
        assert_eq!(store.compact_view(&path).map(|v| v.len()), Some(0));

        store.commit(&path, rev(5).confirmed());

        let state = store.peek(&path).unwrap();
        assert!(!state.is_awaiting_confirm(5));
        assert!(state.record(5).unwrap().confirmed);
        assert_eq!(store.compact_view(&path).map(|v| v.len()), Some(1));
    }

    #[test]
    fn test_replace_history_reconciles_pending() {
        let mut store = RevisionStore::default();
        let path = DocPath::new("a.txt");
        store.get(&path).add_pending(rev(1));
        store.get(&path).add_pending(rev(9));

        store.replace_history(&path, vec![rev(1), rev(2)]);

        let state = store.peek(&path).unwrap();
        assert!(state.history_loaded());
        assert!(!state.is_awaiting_confirm(1));
        assert!(state.is_awaiting_confirm(9));
        assert!(state.all().values().all(|r| r.confirmed));
    }

    #[test]
    fn test_base_records_include_pending() {
        let mut store = RevisionStore::default();
        let path = DocPath::new("a.txt");
        store.commit(&path, rev(1).confirmed());
        store.get(&path).add_pending(rev(4));
        store.commit(&path, rev(2).confirmed());

        let ids: Vec<_> = store.get(&path).base_records().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 4]);
    }

    #[test]
    fn test_toggle_clears_preview_cache() {
        let mut store = RevisionStore::default();
        let path = DocPath::new("a.txt");
        let state = store.get(&path);
        state.cache_preview(
            1,
            PreviewEntry {
                content: "x".into(),
                ranges: Vec::new(),
            },
        );
        state.set_compact_view(true);
        assert!(state.preview(1).is_some());

        state.set_compact_view(false);
        assert!(state.preview(1).is_none());
    }

    #[test]
    fn test_detailed_view_ignores_grouping() {
        let mut store = RevisionStore::default();
        let path = DocPath::new("a.txt");
        store.commit(&path, rev(1));
        store.commit(&path, rev(2));
        assert_eq!(store.compact_view(&path).map(|v| v.len()), Some(1));

        store.get(&path).set_compact_view(false);
        assert_eq!(store.compact_view(&path).map(|v| v.len()), Some(2));
        assert_eq!(store.get(&path).all().len(), 2);
    }

    #[test]
    fn test_rename_moves_state() {
        let mut store = RevisionStore::default();
        let from = DocPath::new("old.txt");
        let to = DocPath::new("new.txt");
        store.commit(&from, rev(3));

        assert!(store.rename(&from, &to));
        assert!(store.peek(&from).is_none());
        assert!(store.peek(&to).unwrap().record(3).is_some());
        assert!(!store.rename(&from, &to));
    }

    #[test]
    fn test_forget_folder() {
        let mut store = RevisionStore::default();
        store.get(&DocPath::new("src/a.rs"));
        store.get(&DocPath::new("src/deep/b.rs"));
        store.get(&DocPath::new("srcs/c.rs"));

        assert_eq!(store.forget_folder(&DocPath::new("src")), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_changed_users_taken_once() {
        let mut store = RevisionStore::default();
        let state = store.get(&DocPath::new("a.txt"));
        state.note_contributors(&["a".to_string(), "b".to_string()]);
        state.note_contributors(&["a".to_string()]);

        assert_eq!(state.take_changed_users(), vec!["a", "b"]);
        assert!(state.changed_users().is_empty());
    }
}
