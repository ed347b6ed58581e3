//! Display-oriented compaction of revision history.
//!
//! Architecture:
//! ```text
//! all (source of truth)              compact view (derived)
//! ┌────┬────┬────┬────┬────┐         ┌─────────┬────┬────┐
//! │ 10 │ 12 │ 15 │ 20 │ 90 │  ────►  │ 10..15  │ 20 │ 90 │
//! └────┴────┴────┴────┴────┘         └─────────┴────┴────┘
//!                 ▲ restoring          keyed by the last id of each group
//! ```
//!
//! Grouping walks ids in ascending order and starts a new group when:
//! 1. the current revision is a restoring revision,
//! 2. the previous revision was a restoring revision,
//! 3. grouping is disabled (detailed view), or
//! 4. the gap to the previous id exceeds the grouping window.
//!
//! Compaction is pure. Reconstructing any individual revision always goes
//! through `all`, never through the compact view.

use std::collections::BTreeMap;

use crate::revision::{merge_contributors, RevisionId, RevisionRecord};

/// Ten minutes, in milliseconds.
pub const DEFAULT_GROUP_WINDOW_MS: u64 = 10 * 60 * 1000;

/// How time-adjacent revisions are folded together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupingRule {
    /// When false every revision is its own group.
    pub enabled: bool,
    /// Maximum gap between consecutive ids of one group (None = unbounded).
    pub window_ms: Option<u64>,
}

impl Default for GroupingRule {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: Some(DEFAULT_GROUP_WINDOW_MS),
        }
    }
}

impl GroupingRule {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            window_ms: None,
        }
    }

    fn splits(&self, prev: &RevisionRecord, current: &RevisionRecord) -> bool {
        !self.enabled
            || current.is_restoring()
            || prev.is_restoring()
            || self
                .window_ms
                .is_some_and(|window| current.id.saturating_sub(prev.id) > window)
    }
}

/// Grouped view of a document's history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactView {
    /// Ordered, time-contiguous partition of the ids in `all`.
    pub groups: Vec<Vec<RevisionId>>,
    /// One synthesized record per group, keyed by the group's last id.
    pub records: BTreeMap<RevisionId, RevisionRecord>,
}

impl CompactView {
    /// The group containing `id`.
    pub fn group_of(&self, id: RevisionId) -> Option<&[RevisionId]> {
        self.groups
            .iter()
            .find(|group| group.binary_search(&id).is_ok())
            .map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Build the compact view of `all` under `rule`.
pub fn compact(all: &BTreeMap<RevisionId, RevisionRecord>, rule: GroupingRule) -> CompactView {
    let groups = partition(all, rule);
    let records = groups
        .iter()
        .filter_map(|group| synthesize(group, all))
        .map(|record| (record.id, record))
        .collect();
    CompactView { groups, records }
}

fn partition(all: &BTreeMap<RevisionId, RevisionRecord>, rule: GroupingRule) -> Vec<Vec<RevisionId>> {
    let mut groups: Vec<Vec<RevisionId>> = Vec::new();
    let mut prev: Option<&RevisionRecord> = None;

    for (id, record) in all {
        let split = match prev {
            Some(prev) => rule.splits(prev, record),
            None => true,
        };
        match groups.last_mut() {
            Some(group) if !split => group.push(*id),
            _ => groups.push(vec![*id]),
        }
        prev = Some(record);
    }

    groups
}

/// Scalar fields come from the last member; patches are concatenated in
/// order; contributors are unioned in first-seen order.
fn synthesize(group: &[RevisionId], all: &BTreeMap<RevisionId, RevisionRecord>) -> Option<RevisionRecord> {
    let last = all.get(group.last()?)?;
    let mut record = RevisionRecord {
        patch: Vec::new(),
        contributors: Vec::new(),
        ..last.clone()
    };
    for member in group.iter().filter_map(|id| all.get(id)) {
        record.patch.extend(member.patch.iter().cloned());
        merge_contributors(&mut record.contributors, &member.contributors);
    }
    Some(record)
}
