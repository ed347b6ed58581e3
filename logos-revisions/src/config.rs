//! Engine configuration.

use std::time::Duration;

use crate::compaction::GroupingRule;

/// Revision engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Quiet interval after the last edit before a diff is requested
    pub debounce: Duration,
    /// Autosave / queue flush period
    pub autosave_interval: Duration,
    /// Autosave the active document on every tick
    pub autosave_enabled: bool,
    /// How revisions are grouped in the compact view
    pub grouping: GroupingRule,
    /// Diff worker mailbox capacity
    pub diff_mailbox_capacity: usize,
    /// Inbound event channel capacity
    pub event_capacity: usize,
    /// Outbound host channel capacity
    pub notice_capacity: usize,
    /// Maximum offline entries kept before new saves are dropped
    pub offline_queue_capacity: usize,
    /// Contributor recorded when nobody edited since the last save
    pub default_user: Option<String>,
    /// Whether the transport is assumed reachable at startup
    pub start_online: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            autosave_interval: Duration::from_secs(60),
            autosave_enabled: false,
            grouping: GroupingRule::default(),
            diff_mailbox_capacity: 64,
            event_capacity: 256,
            notice_capacity: 256,
            offline_queue_capacity: 10_000,
            default_user: None,
            start_online: true,
        }
    }
}

impl EngineConfig {
    /// Short timers and autosave on, for tests.
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(20),
            autosave_interval: Duration::from_millis(200),
            autosave_enabled: true,
            default_user: Some("tester@example.com".to_string()),
            offline_queue_capacity: 64,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.debounce, Duration::from_millis(500));
        assert_eq!(config.autosave_interval, Duration::from_secs(60));
        assert!(!config.autosave_enabled);
        assert!(config.grouping.enabled);
        assert!(config.start_online);
    }
}
