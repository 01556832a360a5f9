// File: tabsync/src/conflict.rs
// Purpose: Field-level conflict detection and resolution between two copies of a group

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::SyncConfig;
use crate::model::{Group, Tab};

/// A group field that differs between the local and remote copies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictField {
    Name,
    IsLocked,
    Tabs,
    UpdatedAt,
}

impl ConflictField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictField::Name => "name",
            ConflictField::IsLocked => "isLocked",
            ConflictField::Tabs => "tabs",
            ConflictField::UpdatedAt => "updatedAt",
        }
    }

    /// Fields whose divergence can't be merged automatically
    pub fn is_hard(&self) -> bool {
        matches!(self, ConflictField::Name | ConflictField::Tabs)
    }
}

impl std::fmt::Display for ConflictField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two diverging copies of one group, detected during a pull. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub local: Group,
    pub remote: Group,
    pub conflicting_fields: Vec<ConflictField>,
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn group_id(&self) -> &str {
        &self.local.id
    }
}

/// How a conflict was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionStrategy {
    RemoteWins,
    LocalWins,
    Merge,
    /// Needs a user decision; no data is proposed
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    pub data: Option<Group>,
}

/// Heuristic resolver: last-writer-wins outside the conflict window, shallow
/// merge of soft fields inside it, manual otherwise.
///
/// Two devices renaming the same group within the window at comparable times
/// end up `Manual`. That is a known limitation of the heuristic.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    window: chrono::Duration,
    skew_threshold: chrono::Duration,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(&SyncConfig::default())
    }
}

impl ConflictResolver {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            window: config.conflict_window(),
            skew_threshold: config.skew_threshold(),
        }
    }

    /// List the fields on which `local` and `remote` disagree.
    /// An empty list means no conflict.
    pub fn detect_conflicts(&self, local: &Group, remote: &Group) -> Vec<ConflictField> {
        let mut fields = Vec::new();

        if local.name != remote.name {
            fields.push(ConflictField::Name);
        }
        if local.is_locked != remote.is_locked {
            fields.push(ConflictField::IsLocked);
        }
        if !local.same_tab_set(remote) {
            fields.push(ConflictField::Tabs);
        }

        let (a, b) = (local.updated_time(), remote.updated_time());
        let skew = if a > b { a - b } else { b - a };
        if skew > self.skew_threshold {
            fields.push(ConflictField::UpdatedAt);
        }

        fields
    }

    /// Build a record if the two copies conflict
    pub fn check(&self, local: &Group, remote: &Group) -> Option<ConflictRecord> {
        let conflicting_fields = self.detect_conflicts(local, remote);
        if conflicting_fields.is_empty() {
            return None;
        }

        Some(ConflictRecord {
            local: local.clone(),
            remote: remote.clone(),
            conflicting_fields,
            detected_at: Utc::now(),
        })
    }

    pub fn resolve(&self, conflict: &ConflictRecord) -> Resolution {
        let local_time = conflict.local.updated_time();
        let remote_time = conflict.remote.updated_time();

        if remote_time > local_time + self.window {
            return Resolution {
                strategy: ResolutionStrategy::RemoteWins,
                data: Some(conflict.remote.clone()),
            };
        }

        if local_time > remote_time + self.window {
            return Resolution {
                strategy: ResolutionStrategy::LocalWins,
                data: Some(conflict.local.clone()),
            };
        }

        if !conflict.conflicting_fields.iter().any(ConflictField::is_hard) {
            return Resolution {
                strategy: ResolutionStrategy::Merge,
                data: Some(merge_groups(&conflict.local, &conflict.remote)),
            };
        }

        tracing::debug!(
            group_id = %conflict.group_id(),
            fields = ?conflict.conflicting_fields,
            "conflict needs manual resolution"
        );
        Resolution {
            strategy: ResolutionStrategy::Manual,
            data: None,
        }
    }
}

/// Shallow merge of two copies of the same group.
///
/// Tabs are unioned by id (local order first), then de-duplicated by
/// normalized URL keeping the most recently created tab. The lock flag is
/// sticky and the version moves past both inputs.
pub fn merge_groups(local: &Group, remote: &Group) -> Group {
    let mut by_id: Vec<Tab> = local.tabs.clone();
    for tab in &remote.tabs {
        match by_id.iter_mut().find(|t| t.id == tab.id) {
            Some(existing) if tab.created_at > existing.created_at => *existing = tab.clone(),
            Some(_) => {}
            None => by_id.push(tab.clone()),
        }
    }

    let mut tabs: Vec<Tab> = Vec::with_capacity(by_id.len());
    let mut slot_by_url: HashMap<String, usize> = HashMap::new();
    for tab in by_id {
        let key = tab.url_key();
        match slot_by_url.get(&key) {
            Some(&slot) => {
                if tab.created_at > tabs[slot].created_at {
                    tabs[slot] = tab;
                }
            }
            None => {
                slot_by_url.insert(key, tabs.len());
                tabs.push(tab);
            }
        }
    }

    let updated_at = Utc::now().max(local.updated_time()).max(remote.updated_time());

    Group {
        id: local.id.clone(),
        name: local.name.clone(),
        tabs,
        is_locked: local.is_locked || remote.is_locked,
        version: local.version.max(remote.version) + 1,
        updated_at: Some(updated_at),
        device_id: local.device_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn tab(id: &str, url: &str, created: i64) -> Tab {
        Tab {
            id: id.into(),
            url: url.into(),
            title: id.into(),
            favicon_url: None,
            created_at: at(created),
        }
    }

    fn group(name: &str, tabs: Vec<Tab>, version: u64, updated: i64) -> Group {
        Group {
            id: "g1".into(),
            name: name.into(),
            tabs,
            is_locked: false,
            version,
            updated_at: Some(at(updated)),
            device_id: None,
        }
    }

    #[test]
    fn test_identical_groups_have_no_conflict() {
        let resolver = ConflictResolver::default();
        let local = group("Work", vec![tab("t1", "https://a.dev", 0)], 2, 0);
        let mut remote = local.clone();
        remote.version = 3;
        remote.updated_at = Some(at(59));

        assert!(resolver.detect_conflicts(&local, &remote).is_empty());
        assert!(resolver.check(&local, &remote).is_none());
    }

    #[test]
    fn test_detects_each_field() {
        let resolver = ConflictResolver::default();
        let local = group("Work", vec![tab("t1", "https://a.dev", 0)], 2, 0);
        let mut remote = group("Play", vec![tab("t2", "https://b.dev", 0)], 3, 61);
        remote.is_locked = true;

        assert_eq!(
            resolver.detect_conflicts(&local, &remote),
            vec![
                ConflictField::Name,
                ConflictField::IsLocked,
                ConflictField::Tabs,
                ConflictField::UpdatedAt,
            ]
        );
    }

    #[test]
    fn test_tab_count_difference_is_a_conflict() {
        let resolver = ConflictResolver::default();
        let local = group("Work", vec![tab("t1", "https://a.dev", 0)], 2, 0);
        let remote = group(
            "Work",
            vec![tab("t1", "https://a.dev", 0), tab("t2", "https://a.dev/", 1)],
            2,
            0,
        );

        assert_eq!(
            resolver.detect_conflicts(&local, &remote),
            vec![ConflictField::Tabs]
        );
    }

    #[test]
    fn test_remote_wins_when_clearly_newer() {
        let resolver = ConflictResolver::default();
        let local = group("Work", vec![], 2, 0);
        let remote = group("Renamed", vec![], 3, 40);
        let record = resolver.check(&local, &remote).unwrap();

        let resolution = resolver.resolve(&record);
        assert_eq!(resolution.strategy, ResolutionStrategy::RemoteWins);
        assert_eq!(resolution.data, Some(remote));
    }

    #[test]
    fn test_local_wins_when_clearly_newer() {
        let resolver = ConflictResolver::default();
        let local = group("Mine", vec![], 4, 100);
        let remote = group("Theirs", vec![], 3, 10);
        let record = resolver.check(&local, &remote).unwrap();

        assert_eq!(resolver.resolve(&record).strategy, ResolutionStrategy::LocalWins);
    }

    #[test]
    fn test_soft_field_conflict_merges() {
        let resolver = ConflictResolver::default();
        let local = group("Work", vec![tab("t1", "https://a.dev", 0)], 5, 0);
        let mut remote = group("Work", vec![tab("t1", "https://a.dev", 0)], 7, 10);
        remote.is_locked = true;
        let record = resolver.check(&local, &remote).unwrap();

        let resolution = resolver.resolve(&record);
        assert_eq!(resolution.strategy, ResolutionStrategy::Merge);

        let merged = resolution.data.unwrap();
        assert!(merged.is_locked);
        assert_eq!(merged.version, 8);
        assert_eq!(merged.tabs.len(), 1);
    }

    #[test]
    fn test_concurrent_rename_needs_manual_resolution() {
        let resolver = ConflictResolver::default();
        let local = group("Mine", vec![], 2, 0);
        let remote = group("Theirs", vec![], 2, 20);
        let record = resolver.check(&local, &remote).unwrap();

        let resolution = resolver.resolve(&record);
        assert_eq!(resolution.strategy, ResolutionStrategy::Manual);
        assert!(resolution.data.is_none());
    }

    #[test]
    fn test_merge_unions_tabs_and_dedups_by_url() {
        let local = group(
            "Work",
            vec![tab("t1", "https://a.dev", 10), tab("t2", "https://b.dev", 5)],
            1,
            0,
        );
        let remote = group(
            "Work",
            vec![tab("t3", "https://A.dev/", 20), tab("t4", "https://c.dev", 1)],
            1,
            0,
        );

        let merged = merge_groups(&local, &remote);
        let ids: Vec<&str> = merged.tabs.iter().map(|t| t.id.as_str()).collect();

        assert_eq!(ids, vec!["t3", "t2", "t4"]);
        assert_eq!(merged.version, 2);
    }

    #[test]
    fn test_merge_same_id_keeps_newer_copy() {
        let local = group("Work", vec![tab("t1", "https://old.dev", 1)], 1, 0);
        let remote = group("Work", vec![tab("t1", "https://new.dev", 2)], 1, 0);

        let merged = merge_groups(&local, &remote);
        assert_eq!(merged.tabs.len(), 1);
        assert_eq!(merged.tabs[0].url, "https://new.dev");
    }
}
