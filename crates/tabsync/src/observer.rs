// File: tabsync/src/observer.rs
// Purpose: Optional hook for snapshotting orchestration stages

use serde::Serialize;

/// Points in an orchestration where observers are notified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    PullStarted,
    Downloaded,
    ConflictsResolved,
    LocalWritten,
    Pushed,
    PushOnlyStarted,
    Failed,
}

impl SyncStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::PullStarted => "pull_started",
            SyncStage::Downloaded => "downloaded",
            SyncStage::ConflictsResolved => "conflicts_resolved",
            SyncStage::LocalWritten => "local_written",
            SyncStage::Pushed => "pushed",
            SyncStage::PushOnlyStarted => "push_only_started",
            SyncStage::Failed => "failed",
        }
    }
}

/// Counts describing the data at a stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageSnapshot {
    pub local_groups: usize,
    pub remote_groups: usize,
    pub total_tabs: usize,
    pub conflicts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Receives a snapshot at each stage. Must not block.
pub trait SyncObserver: Send + Sync {
    fn on_stage(&self, stage: SyncStage, snapshot: &StageSnapshot);
}

/// Forwards every stage to `tracing` at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn on_stage(&self, stage: SyncStage, snapshot: &StageSnapshot) {
        tracing::debug!(
            stage = stage.as_str(),
            local_groups = snapshot.local_groups,
            remote_groups = snapshot.remote_groups,
            total_tabs = snapshot.total_tabs,
            conflicts = snapshot.conflicts,
            detail = snapshot.detail.as_deref().unwrap_or(""),
            "sync stage"
        );
    }
}
