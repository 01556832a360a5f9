// File: tabsync/src/orchestrator.rs
// Purpose: Pull-first sync state machine (Pull -> Resolve -> Push, or Push-only)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::config::SyncConfig;
use crate::conflict::{ConflictRecord, ConflictResolver, ResolutionStrategy};
use crate::coordinator::PendingOperations;
use crate::error::SyncError;
use crate::model::{collect_garbage, total_tabs, Group};
use crate::observer::{StageSnapshot, SyncObserver, SyncStage};
use crate::retry::retry_with_backoff;
use crate::storage::{AuthProvider, LocalStore, RemoteClient};

/// Orchestrator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Idle,
    Pulling,
    ConflictResolving,
    Pushing,
    PushingOnly,
}

/// Counters for one orchestration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub groups_downloaded: usize,
    pub conflicts_detected: usize,
    pub conflicts_auto_resolved: usize,
    pub groups_uploaded: usize,
    /// Remote copies ignored because a local operation protected the group
    pub protected_skipped: usize,
}

/// Structured outcome of an orchestration. Failures are reported here, never thrown.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    pub success: bool,
    pub message: String,
    pub error: Option<SyncError>,
    pub groups: Vec<Group>,
    /// Conflicts that need a user decision; the applied state fell back to last-writer-wins
    pub unresolved: Vec<ConflictRecord>,
    pub stats: SyncStats,
}

impl SyncResult {
    fn failed(error: SyncError) -> Self {
        let message = match &error {
            SyncError::AlreadyInProgress => "in progress".to_string(),
            SyncError::AuthRequired => "not authenticated".to_string(),
            other => other.to_string(),
        };
        Self {
            success: false,
            message,
            error: Some(error),
            groups: Vec::new(),
            unresolved: Vec::new(),
            stats: SyncStats::default(),
        }
    }

    fn completed(message: impl Into<String>, groups: Vec<Group>, stats: SyncStats) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            groups,
            unresolved: Vec::new(),
            stats,
        }
    }

    /// `ConflictUnresolved` when manual conflicts were surfaced
    pub fn conflict_error(&self) -> Option<SyncError> {
        (!self.unresolved.is_empty()).then(|| SyncError::ConflictUnresolved {
            count: self.unresolved.len(),
        })
    }
}

struct Reconciled {
    groups: Vec<Group>,
    unresolved: Vec<ConflictRecord>,
    stats: SyncStats,
    /// Local deletions honoured by this pull
    deletions: HashSet<String>,
}

/// Releases the sync flag and returns the state to idle on drop
struct SyncGuard<'a> {
    orchestrator: &'a SyncOrchestrator,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.state_tx.send_replace(SyncState::Idle);
        self.orchestrator.syncing.store(false, Ordering::Release);
    }
}

/// Top-level sync service
///
/// Owns the single `syncing` flag: a call made while another orchestration is
/// running returns immediately with `AlreadyInProgress`. Queuing of requests
/// belongs to [`SyncQueue`](crate::queue::SyncQueue).
pub struct SyncOrchestrator {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteClient>,
    auth: Arc<dyn AuthProvider>,
    pending: Arc<PendingOperations>,
    resolver: ConflictResolver,
    observer: Option<Arc<dyn SyncObserver>>,
    network_timeout: Duration,
    retry_attempts: u32,
    retry_unit: Duration,
    syncing: AtomicBool,
    state_tx: watch::Sender<SyncState>,
    groups_tx: watch::Sender<Vec<Group>>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    /// Groups deleted locally that no successful push has removed remotely yet
    deleted: Mutex<HashSet<String>>,
}

impl SyncOrchestrator {
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        auth: Arc<dyn AuthProvider>,
        pending: Arc<PendingOperations>,
        config: &SyncConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SyncState::Idle);
        let (groups_tx, _) = watch::channel(Vec::new());

        Self {
            local,
            remote,
            auth,
            pending,
            resolver: ConflictResolver::new(config),
            observer: None,
            network_timeout: config.network_timeout(),
            retry_attempts: config.retry_attempts,
            retry_unit: config.retry_unit(),
            syncing: AtomicBool::new(false),
            state_tx,
            groups_tx,
            last_sync: Mutex::new(None),
            deleted: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> SyncState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Time of the last successful orchestration
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// In-memory group list, updated whenever local storage is rewritten
    pub fn subscribe_groups(&self) -> watch::Receiver<Vec<Group>> {
        self.groups_tx.subscribe()
    }

    pub fn publish_groups(&self, groups: Vec<Group>) {
        self.groups_tx.send_replace(groups);
    }

    /// Record groups removed from local storage.
    ///
    /// Call after the removal is persisted. Until a push that read local
    /// state afterwards succeeds, pulls drop the remote copies of these groups.
    pub fn record_deletions<I>(&self, group_ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut deleted = self.deleted.lock().unwrap_or_else(|e| e.into_inner());
        for id in group_ids {
            tracing::debug!(group_id = %id, "local deletion recorded");
            deleted.insert(id);
        }
    }

    /// Local deletions not yet pushed
    pub fn pending_deletions(&self) -> HashSet<String> {
        self.deleted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn clear_deletions(&self, pushed: &HashSet<String>) {
        if pushed.is_empty() {
            return;
        }
        self.deleted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|id| !pushed.contains(id));
    }

    /// Pull, resolve conflicts, write locally, then push the merged set
    pub async fn pull_first(&self) -> SyncResult {
        let _guard = match self.begin(SyncState::Pulling) {
            Ok(guard) => guard,
            Err(err) => return SyncResult::failed(err),
        };

        match self.pull_and_push().await {
            Ok(result) => result,
            Err(err) => self.fail("pull_first", err),
        }
    }

    /// Pull and resolve without pushing afterwards
    pub async fn pull_latest(&self) -> SyncResult {
        let _guard = match self.begin(SyncState::Pulling) {
            Ok(guard) => guard,
            Err(err) => return SyncResult::failed(err),
        };

        match self.pull().await {
            Ok(reconciled) => {
                self.mark_synced();
                let mut result = SyncResult::completed(
                    "pulled latest",
                    reconciled.groups,
                    reconciled.stats,
                );
                result.unresolved = reconciled.unresolved;
                result
            }
            Err(err) => self.fail("pull_latest", err),
        }
    }

    /// Upload local state with overwrite; the remote ends up mirroring it
    pub async fn push_only(&self) -> SyncResult {
        let _guard = match self.begin(SyncState::PushingOnly) {
            Ok(guard) => guard,
            Err(err) => return SyncResult::failed(err),
        };

        // snapshot before reading local state so a deletion persisted later stays recorded
        let deletions = self.pending_deletions();
        let outcome = async {
            let groups = self.load_stamped().await?;
            self.stage(SyncStage::PushOnlyStarted, &groups, 0, 0);
            let uploaded = groups.len();
            self.with_deadline("upload groups", self.remote.upload_groups(groups.clone(), true))
                .await?;
            self.stage(SyncStage::Pushed, &groups, uploaded, 0);
            Ok::<_, SyncError>(groups)
        }
        .await;

        match outcome {
            Ok(groups) => {
                self.clear_deletions(&deletions);
                self.mark_synced();
                let stats = SyncStats {
                    groups_uploaded: groups.len(),
                    ..SyncStats::default()
                };
                tracing::info!(groups = groups.len(), "push-only sync complete");
                SyncResult::completed("pushed", groups, stats)
            }
            Err(err) => self.fail("push_only", err),
        }
    }

    /// Push local state with overwrite, retrying with linear backoff.
    ///
    /// For repairing a remote that drifted from this device's state; the
    /// regular paths never retry on their own.
    pub async fn repair_remote(&self) -> SyncResult {
        let _guard = match self.begin(SyncState::PushingOnly) {
            Ok(guard) => guard,
            Err(err) => return SyncResult::failed(err),
        };

        let deletions = self.pending_deletions();
        let groups = match self.load_stamped().await {
            Ok(groups) => groups,
            Err(err) => return self.fail("repair_remote", err),
        };

        let uploaded = retry_with_backoff(self.retry_attempts, self.retry_unit, |_| {
            let groups = groups.clone();
            async move {
                self.with_deadline("upload groups", self.remote.upload_groups(groups, true))
                    .await
            }
        })
        .await;

        match uploaded {
            Ok(()) => {
                self.clear_deletions(&deletions);
                self.mark_synced();
                tracing::info!(groups = groups.len(), "remote repaired from local state");
                let stats = SyncStats {
                    groups_uploaded: groups.len(),
                    ..SyncStats::default()
                };
                SyncResult::completed("remote repaired", groups, stats)
            }
            Err(failure) => {
                let err = match failure.error {
                    SyncError::Network { message, .. } => SyncError::Network {
                        message,
                        retries: failure.retries,
                    },
                    other => other,
                };
                self.fail("repair_remote", err)
            }
        }
    }

    fn begin(&self, state: SyncState) -> Result<SyncGuard<'_>, SyncError> {
        if !self.auth.is_authenticated() {
            tracing::debug!("sync skipped, not authenticated");
            return Err(SyncError::AuthRequired);
        }

        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("sync skipped, another orchestration is running");
            return Err(SyncError::AlreadyInProgress);
        }

        self.state_tx.send_replace(state);
        Ok(SyncGuard { orchestrator: self })
    }

    async fn pull_and_push(&self) -> Result<SyncResult, SyncError> {
        let reconciled = self.pull().await?;

        self.state_tx.send_replace(SyncState::Pushing);
        let mut stats = reconciled.stats;
        stats.groups_uploaded = reconciled.groups.len();
        self.with_deadline(
            "upload groups",
            self.remote.upload_groups(reconciled.groups.clone(), true),
        )
        .await?;
        self.clear_deletions(&reconciled.deletions);
        self.stage(
            SyncStage::Pushed,
            &reconciled.groups,
            stats.groups_uploaded,
            reconciled.unresolved.len(),
        );

        self.mark_synced();
        tracing::info!(
            groups = reconciled.groups.len(),
            conflicts = stats.conflicts_detected,
            unresolved = reconciled.unresolved.len(),
            "pull-first sync complete"
        );

        let mut result = SyncResult::completed("synced", reconciled.groups, stats);
        result.unresolved = reconciled.unresolved;
        Ok(result)
    }

    async fn pull(&self) -> Result<Reconciled, SyncError> {
        let deletions = self.pending_deletions();
        let local_groups = self
            .local
            .get_groups()
            .await
            .map_err(|e| SyncError::storage(&e))?;
        self.stage(SyncStage::PullStarted, &local_groups, 0, 0);

        let remote_groups = self
            .with_deadline("download groups", self.remote.download_groups())
            .await?;
        self.stage(SyncStage::Downloaded, &local_groups, remote_groups.len(), 0);

        let mut reconciled = self.reconcile(local_groups, remote_groups, deletions);
        for group in &mut reconciled.groups {
            group.stamp_if_missing();
        }
        self.stage(
            SyncStage::ConflictsResolved,
            &reconciled.groups,
            reconciled.stats.groups_downloaded,
            reconciled.unresolved.len(),
        );

        self.local
            .set_groups(reconciled.groups.clone())
            .await
            .map_err(|e| SyncError::storage(&e))?;
        self.publish_groups(reconciled.groups.clone());
        self.stage(
            SyncStage::LocalWritten,
            &reconciled.groups,
            reconciled.stats.groups_downloaded,
            reconciled.unresolved.len(),
        );

        Ok(reconciled)
    }

    /// Merge remote groups into local ones.
    ///
    /// Local order is kept, remote-only groups are appended in remote order.
    /// Groups under local protection keep their local copy, or stay absent
    /// when the local copy is gone. Groups deleted locally are not restored.
    fn reconcile(
        &self,
        local_groups: Vec<Group>,
        remote_groups: Vec<Group>,
        deletions: HashSet<String>,
    ) -> Reconciled {
        let mut stats = SyncStats {
            groups_downloaded: remote_groups.len(),
            ..SyncStats::default()
        };
        let mut unresolved = Vec::new();

        let local_ids: HashSet<String> = local_groups.iter().map(|g| g.id.clone()).collect();
        let mut remote_by_id: HashMap<String, Group> = HashMap::new();
        let mut remote_only = Vec::new();
        for group in remote_groups {
            if local_ids.contains(&group.id) {
                remote_by_id.insert(group.id.clone(), group);
            } else {
                remote_only.push(group);
            }
        }

        let mut merged = Vec::with_capacity(local_groups.len() + remote_only.len());
        for local in local_groups {
            let Some(remote) = remote_by_id.remove(&local.id) else {
                merged.push(local);
                continue;
            };

            if self.pending.is_protected(&local.id) {
                tracing::debug!(group_id = %local.id, "remote copy skipped, group is protected");
                stats.protected_skipped += 1;
                merged.push(local);
                continue;
            }

            let Some(record) = self.resolver.check(&local, &remote) else {
                merged.push(newer_version(local, remote));
                continue;
            };

            stats.conflicts_detected += 1;
            self.state_tx.send_replace(SyncState::ConflictResolving);
            let resolution = self.resolver.resolve(&record);
            tracing::debug!(
                group_id = %record.group_id(),
                strategy = ?resolution.strategy,
                "conflict resolved"
            );

            match (resolution.strategy, resolution.data) {
                (ResolutionStrategy::Manual, _) | (_, None) => {
                    merged.push(last_writer(local, remote));
                    unresolved.push(record);
                }
                (_, Some(data)) => {
                    stats.conflicts_auto_resolved += 1;
                    merged.push(data);
                }
            }
        }

        for mut remote in remote_only {
            if deletions.contains(&remote.id) {
                tracing::debug!(group_id = %remote.id, "remote copy dropped, deleted locally");
                continue;
            }
            if self.pending.is_protected(&remote.id) {
                tracing::debug!(group_id = %remote.id, "remote copy skipped, group is protected");
                stats.protected_skipped += 1;
                continue;
            }
            remote.version = remote.version.max(1);
            merged.push(remote);
        }

        Reconciled {
            groups: collect_garbage(merged),
            unresolved,
            stats,
            deletions,
        }
    }

    async fn load_stamped(&self) -> Result<Vec<Group>, SyncError> {
        let mut groups = self
            .local
            .get_groups()
            .await
            .map_err(|e| SyncError::storage(&e))?;

        let stamped = groups
            .iter_mut()
            .fold(0, |n, g| n + usize::from(g.stamp_if_missing()));
        if stamped > 0 {
            tracing::debug!(stamped, "stamped unversioned groups before push");
            self.local
                .set_groups(groups.clone())
                .await
                .map_err(|e| SyncError::storage(&e))?;
        }
        Ok(groups)
    }

    async fn with_deadline<T>(
        &self,
        what: &'static str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.network_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(SyncError::network(&e.context(what), 0)),
            Err(_) => {
                tracing::warn!(
                    call = what,
                    timeout_ms = self.network_timeout.as_millis() as u64,
                    "network call timed out"
                );
                Err(SyncError::Timeout(self.network_timeout))
            }
        }
    }

    fn mark_synced(&self) {
        *self.last_sync.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }

    fn fail(&self, operation: &'static str, err: SyncError) -> SyncResult {
        if let Some(observer) = &self.observer {
            observer.on_stage(
                SyncStage::Failed,
                &StageSnapshot {
                    detail: Some(err.to_string()),
                    ..StageSnapshot::default()
                },
            );
        }
        tracing::warn!(operation, error = %err, "sync failed");
        SyncResult::failed(err)
    }

    fn stage(&self, stage: SyncStage, groups: &[Group], remote_groups: usize, conflicts: usize) {
        if let Some(observer) = &self.observer {
            observer.on_stage(
                stage,
                &StageSnapshot {
                    local_groups: groups.len(),
                    remote_groups,
                    total_tabs: total_tabs(groups),
                    conflicts,
                    detail: None,
                },
            );
        }
    }
}

/// Conflict-free pair: higher version wins, remote on ties
fn newer_version(local: Group, mut remote: Group) -> Group {
    if local.version > remote.version {
        local
    } else {
        remote.version = remote.version.max(1);
        remote
    }
}

fn last_writer(local: Group, remote: Group) -> Group {
    if local.updated_time() > remote.updated_time() {
        local
    } else {
        remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::OperationKind;
    use crate::model::Tab;
    use crate::storage::memory::{MemoryLocalStore, MemoryRemote, StaticAuth};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    struct Fixture {
        orchestrator: Arc<SyncOrchestrator>,
        local: Arc<MemoryLocalStore>,
        remote: Arc<MemoryRemote>,
        auth: Arc<StaticAuth>,
        pending: Arc<PendingOperations>,
    }

    fn fixture(local_groups: Vec<Group>, remote_groups: Vec<Group>) -> Fixture {
        let config = SyncConfig::default();
        let local = Arc::new(MemoryLocalStore::with_groups(local_groups));
        let remote = Arc::new(MemoryRemote::with_groups(remote_groups));
        let auth = Arc::new(StaticAuth::new(true));
        let pending = PendingOperations::from_config(&config);
        let orchestrator = Arc::new(SyncOrchestrator::new(
            local.clone(),
            remote.clone(),
            auth.clone(),
            pending.clone(),
            &config,
        ));
        Fixture {
            orchestrator,
            local,
            remote,
            auth,
            pending,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn group(id: &str, name: &str, version: u64, updated: i64) -> Group {
        Group {
            id: id.into(),
            name: name.into(),
            tabs: vec![Tab {
                id: format!("{}-tab", id),
                url: format!("https://{}.dev", id),
                title: String::new(),
                favicon_url: None,
                created_at: at(0),
            }],
            is_locked: false,
            version,
            updated_at: Some(at(updated)),
            device_id: None,
        }
    }

    #[tokio::test]
    async fn test_pull_first_remote_wins_when_newer() {
        let local = group("g1", "Reading", 2, 0);
        let remote = group("g1", "Reading list", 3, 40);
        let f = fixture(vec![local], vec![remote.clone()]);

        let result = f.orchestrator.pull_first().await;

        assert!(result.success, "{}", result.message);
        assert_eq!(result.stats.conflicts_detected, 1);
        assert_eq!(result.stats.conflicts_auto_resolved, 1);
        assert_eq!(f.local.snapshot().await, vec![remote.clone()]);
        assert_eq!(f.local.snapshot().await[0].version, 3);
        assert_eq!(f.remote.snapshot().await, vec![remote]);
        assert_eq!(f.orchestrator.state(), SyncState::Idle);
        assert!(f.orchestrator.last_sync().is_some());
    }

    #[tokio::test]
    async fn test_pull_first_unions_groups_without_conflicts() {
        let shared_local = group("shared", "Shared", 2, 0);
        let mut shared_remote = shared_local.clone();
        shared_remote.version = 4;
        let local_only = group("mine", "Mine", 1, 0);
        let mut remote_only = group("theirs", "Theirs", 0, 0);
        remote_only.version = 0;

        let f = fixture(
            vec![shared_local, local_only.clone()],
            vec![remote_only, shared_remote.clone()],
        );

        let result = f.orchestrator.pull_first().await;

        assert!(result.success);
        assert_eq!(result.stats.conflicts_detected, 0);
        let stored = f.local.snapshot().await;
        let ids: Vec<&str> = stored.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["shared", "mine", "theirs"]);
        assert_eq!(stored[0], shared_remote);
        assert_eq!(stored[1], local_only);
        assert_eq!(stored[2].version, 1);
        assert_eq!(f.remote.snapshot().await, stored);
    }

    #[tokio::test]
    async fn test_pull_first_surfaces_manual_conflicts() {
        let local = group("g1", "Mine", 2, 0);
        let remote = group("g1", "Theirs", 2, 10);
        let f = fixture(vec![local], vec![remote.clone()]);

        let result = f.orchestrator.pull_first().await;

        assert!(result.success);
        assert_eq!(result.unresolved.len(), 1);
        assert_eq!(
            result.conflict_error(),
            Some(SyncError::ConflictUnresolved { count: 1 })
        );
        // falls back to the later write
        assert_eq!(f.local.snapshot().await, vec![remote]);
    }

    #[tokio::test]
    async fn test_protected_group_keeps_local_copy() {
        let local = group("g1", "Local edit", 5, 100);
        let remote = group("g1", "Remote", 9, 0);
        let f = fixture(vec![local.clone()], vec![remote]);
        f.pending
            .register(OperationKind::Update, vec!["g1".into()], HashMap::new());

        let result = f.orchestrator.pull_latest().await;

        assert!(result.success);
        assert_eq!(result.stats.protected_skipped, 1);
        assert_eq!(f.local.snapshot().await, vec![local]);
    }

    #[tokio::test]
    async fn test_protected_delete_is_not_undone_by_pull() {
        let f = fixture(vec![], vec![group("g1", "Deleting", 3, 0)]);
        f.pending
            .register(OperationKind::Delete, vec!["g1".into()], HashMap::new());

        let result = f.orchestrator.pull_latest().await;

        assert!(result.success);
        assert_eq!(result.stats.protected_skipped, 1);
        assert!(f.local.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_recorded_deletion_survives_pull_until_pushed() {
        let kept = group("g2", "Kept", 1, 0);
        let f = fixture(vec![kept.clone()], vec![group("g1", "Gone", 3, 0), kept.clone()]);
        f.orchestrator.record_deletions(["g1".to_string()]);

        let pulled = f.orchestrator.pull_latest().await;
        assert!(pulled.success);
        assert_eq!(f.local.snapshot().await, vec![kept.clone()]);
        assert!(f.orchestrator.pending_deletions().contains("g1"));

        let synced = f.orchestrator.pull_first().await;
        assert!(synced.success);
        assert_eq!(f.remote.snapshot().await, vec![kept]);
        assert!(f.orchestrator.pending_deletions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_push_keeps_recorded_deletion() {
        let f = fixture(vec![], vec![group("g1", "Gone", 3, 0)]);
        f.orchestrator.record_deletions(["g1".to_string()]);
        f.remote.fail_uploads(1);

        assert!(!f.orchestrator.push_only().await.success);
        assert!(f.orchestrator.pending_deletions().contains("g1"));

        assert!(f.orchestrator.pull_first().await.success);
        assert!(f.local.snapshot().await.is_empty());
        assert!(f.remote.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_pull_latest_does_not_push() {
        let f = fixture(vec![group("g1", "Local", 1, 0)], vec![]);

        let result = f.orchestrator.pull_latest().await;

        assert!(result.success);
        assert_eq!(f.remote.stats().uploads, 0);
        assert!(f.remote.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_push_only_is_idempotent() {
        let mut unstamped = group("g1", "Docs", 0, 0);
        unstamped.updated_at = None;
        let stale = group("gone", "Deleted locally", 3, 0);
        let f = fixture(vec![unstamped, group("g2", "Work", 4, 0)], vec![stale]);

        let first = f.orchestrator.push_only().await;
        assert!(first.success);
        let after_first = f.remote.snapshot().await;
        let stats_first = f.remote.stats();
        assert_eq!(stats_first.deleted, 1);
        assert_eq!(after_first, f.local.snapshot().await);
        assert_eq!(after_first[0].version, 1);
        assert_eq!(after_first[1].version, 4);

        let second = f.orchestrator.push_only().await;
        assert!(second.success);
        let stats_second = f.remote.stats();

        assert_eq!(f.remote.snapshot().await, after_first);
        assert_eq!(stats_second.changed, stats_first.changed);
        assert_eq!(stats_second.deleted, stats_first.deleted);
    }

    #[tokio::test]
    async fn test_requires_authentication() {
        let f = fixture(vec![group("g1", "Docs", 1, 0)], vec![]);
        f.auth.set(false);

        let result = f.orchestrator.pull_first().await;

        assert!(!result.success);
        assert_eq!(result.error, Some(SyncError::AuthRequired));
        assert_eq!(f.remote.stats(), Default::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_call_returns_in_progress() {
        let f = fixture(vec![group("g1", "Docs", 1, 0)], vec![]);
        f.remote.set_latency(Some(Duration::from_secs(1)));

        let running = {
            let orchestrator = f.orchestrator.clone();
            tokio::spawn(async move { orchestrator.pull_first().await })
        };
        tokio::task::yield_now().await;
        assert!(f.orchestrator.is_syncing());

        let overlapping = f.orchestrator.push_only().await;
        assert!(!overlapping.success);
        assert_eq!(overlapping.error, Some(SyncError::AlreadyInProgress));
        assert_eq!(overlapping.message, "in progress");

        assert!(running.await.unwrap().success);
        assert!(!f.orchestrator.is_syncing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_deadline_releases_flag() {
        let f = fixture(vec![group("g1", "Docs", 1, 0)], vec![]);
        f.remote.set_latency(Some(Duration::from_secs(120)));

        let result = f.orchestrator.pull_first().await;

        assert!(matches!(result.error, Some(SyncError::Timeout(_))));
        assert!(!f.orchestrator.is_syncing());
        assert_eq!(f.orchestrator.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_storage_failure_aborts_before_network() {
        let f = fixture(vec![], vec![group("g1", "Remote", 1, 0)]);
        f.local.set_failing(true);

        let result = f.orchestrator.pull_first().await;

        assert!(matches!(result.error, Some(SyncError::Storage(_))));
        assert_eq!(f.remote.stats().downloads, 0);
    }

    #[tokio::test]
    async fn test_pull_publishes_groups() {
        let remote = group("g1", "Remote", 1, 0);
        let f = fixture(vec![], vec![remote.clone()]);
        let rx = f.orchestrator.subscribe_groups();

        f.orchestrator.pull_latest().await;

        assert_eq!(*rx.borrow(), vec![remote]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repair_remote_retries_with_backoff() {
        let f = fixture(vec![group("g1", "Docs", 1, 0)], vec![]);
        f.remote.fail_next(2);

        let result = f.orchestrator.repair_remote().await;

        assert!(result.success);
        assert_eq!(f.remote.snapshot().await, f.local.snapshot().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repair_remote_reports_retry_count() {
        let f = fixture(vec![group("g1", "Docs", 1, 0)], vec![]);
        f.remote.fail_next(10);

        let result = f.orchestrator.repair_remote().await;

        match result.error {
            Some(SyncError::Network { retries, .. }) => assert_eq!(retries, 3),
            other => panic!("unexpected {:?}", other),
        }
    }
}
