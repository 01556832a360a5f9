// File: tabsync/src/coordinator.rs
// Purpose: Write protection for in-flight local operations and protected compound operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::config::SyncConfig;
use crate::dedup::remove_duplicates;
use crate::device::DeviceFilter;
use crate::error::SyncError;
use crate::model::Group;
use crate::orchestrator::SyncOrchestrator;
use crate::storage::LocalStore;

/// Kind of protected operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Deduplicate,
    Delete,
    Update,
    Create,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Deduplicate => "deduplicate",
            OperationKind::Delete => "delete",
            OperationKind::Update => "update",
            OperationKind::Create => "create",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(String);

impl OperationId {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A local operation currently protected against inbound sync
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub group_ids: Vec<String>,
    pub expected_versions: HashMap<String, u64>,
    pub created_at: DateTime<Utc>,
}

struct Entry {
    operation: PendingOperation,
    expiry: Option<AbortHandle>,
}

/// Registry of pending operations.
///
/// Each registration arms a one-shot expiry timer; completing the operation
/// aborts the timer. Unrelated operations never wait on each other.
pub struct PendingOperations {
    entries: Mutex<HashMap<OperationId, Entry>>,
    timeout: Duration,
}

impl PendingOperations {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        })
    }

    pub fn from_config(config: &SyncConfig) -> Arc<Self> {
        Self::new(config.protection_timeout())
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<OperationId, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a pending operation and arm its expiry.
    ///
    /// Outside a tokio runtime no timer can be armed; the operation then
    /// lives until completed.
    pub fn register(
        self: &Arc<Self>,
        kind: OperationKind,
        group_ids: Vec<String>,
        expected_versions: HashMap<String, u64>,
    ) -> OperationId {
        let operation_id = OperationId::generate();
        let operation = PendingOperation {
            operation_id: operation_id.clone(),
            kind,
            group_ids,
            expected_versions,
            created_at: Utc::now(),
        };

        let expiry = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = Arc::downgrade(self);
                let id = operation_id.clone();
                let timeout = self.timeout;
                Some(
                    handle
                        .spawn(async move {
                            tokio::time::sleep(timeout).await;
                            expire(registry, &id);
                        })
                        .abort_handle(),
                )
            }
            Err(_) => {
                tracing::warn!(
                    operation_id = %operation_id,
                    "no runtime, protection will not expire"
                );
                None
            }
        };

        tracing::debug!(
            operation_id = %operation_id,
            kind = kind.as_str(),
            groups = operation.group_ids.len(),
            "protected operation registered"
        );
        self.entries()
            .insert(operation_id.clone(), Entry { operation, expiry });
        operation_id
    }

    /// Remove the operation and cancel its timer. Returns false if it was
    /// already gone.
    pub fn complete(&self, operation_id: &OperationId) -> bool {
        let removed = self.entries().remove(operation_id);
        match removed {
            Some(entry) => {
                if let Some(expiry) = entry.expiry {
                    expiry.abort();
                }
                tracing::debug!(operation_id = %operation_id, "protected operation completed");
                true
            }
            None => false,
        }
    }

    /// True if any pending operation touches one of `group_ids`
    pub fn has_conflicting(&self, group_ids: &[String]) -> bool {
        if group_ids.is_empty() {
            return false;
        }
        let wanted: HashSet<&str> = group_ids.iter().map(String::as_str).collect();
        self.entries().values().any(|entry| {
            entry
                .operation
                .group_ids
                .iter()
                .any(|id| wanted.contains(id.as_str()))
        })
    }

    pub fn is_protected(&self, group_id: &str) -> bool {
        self.entries()
            .values()
            .any(|entry| entry.operation.group_ids.iter().any(|id| id == group_id))
    }

    pub fn get(&self, operation_id: &OperationId) -> Option<PendingOperation> {
        self.entries()
            .get(operation_id)
            .map(|entry| entry.operation.clone())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn expire(registry: Weak<PendingOperations>, operation_id: &OperationId) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    if registry.entries().remove(operation_id).is_some() {
        tracing::warn!(
            operation_id = %operation_id,
            timeout_ms = registry.timeout.as_millis() as u64,
            "protected operation expired without completion"
        );
    }
}

/// Completes its operation when dropped, so protection is released on every
/// exit path including cancellation.
pub struct OperationGuard {
    pending: Arc<PendingOperations>,
    operation_id: OperationId,
}

impl OperationGuard {
    pub fn id(&self) -> &OperationId {
        &self.operation_id
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.pending.complete(&self.operation_id);
    }
}

/// Outcome of [`SyncCoordinator::execute_protected_deduplication`]
#[derive(Debug, Clone, PartialEq)]
pub struct DedupOutcome {
    pub removed_count: usize,
    pub operation_id: OperationId,
    /// False when nothing needed pushing, the session is signed out, or the push failed
    pub pushed: bool,
    pub push_error: Option<SyncError>,
}

/// Serializes local compound operations against inbound sync
pub struct SyncCoordinator {
    pending: Arc<PendingOperations>,
    orchestrator: Arc<SyncOrchestrator>,
    local: Arc<dyn LocalStore>,
    device: Arc<DeviceFilter>,
}

impl SyncCoordinator {
    /// `pending` must be the same registry the orchestrator consults during pulls
    pub fn new(
        pending: Arc<PendingOperations>,
        orchestrator: Arc<SyncOrchestrator>,
        local: Arc<dyn LocalStore>,
        device: Arc<DeviceFilter>,
    ) -> Self {
        Self {
            pending,
            orchestrator,
            local,
            device,
        }
    }

    pub fn pending(&self) -> &Arc<PendingOperations> {
        &self.pending
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Register a protected operation, snapshotting the current version of
    /// each group from local storage.
    pub async fn register_operation(
        &self,
        kind: OperationKind,
        group_ids: Vec<String>,
    ) -> OperationId {
        let expected_versions = match self.local.get_groups().await {
            Ok(groups) => versions_of(&groups, &group_ids),
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "could not snapshot versions");
                HashMap::new()
            }
        };
        self.pending.register(kind, group_ids, expected_versions)
    }

    /// Like [`register_operation`](Self::register_operation) but releases the
    /// protection when the returned guard drops.
    pub async fn begin_operation(
        &self,
        kind: OperationKind,
        group_ids: Vec<String>,
    ) -> OperationGuard {
        let operation_id = self.register_operation(kind, group_ids).await;
        OperationGuard {
            pending: self.pending.clone(),
            operation_id,
        }
    }

    fn guard_for(&self, kind: OperationKind, groups: &[Group]) -> OperationGuard {
        let group_ids: Vec<String> = groups.iter().map(|g| g.id.clone()).collect();
        let expected_versions = versions_of(groups, &group_ids);
        let operation_id = self.pending.register(kind, group_ids, expected_versions);
        OperationGuard {
            pending: self.pending.clone(),
            operation_id,
        }
    }

    pub fn complete_operation(&self, operation_id: &OperationId) -> bool {
        self.pending.complete(operation_id)
    }

    pub fn has_conflicting_operation(&self, group_ids: &[String]) -> bool {
        self.pending.has_conflicting(group_ids)
    }

    /// Pull, then remove duplicate tabs across all groups under protection,
    /// persist, and push with overwrite.
    ///
    /// A failed pull aborts before anything is registered. A signed-out
    /// session deduplicates locally without pushing. Push failures are
    /// reported in the outcome rather than as an error.
    pub async fn execute_protected_deduplication(&self) -> Result<DedupOutcome, SyncError> {
        let pull = self.orchestrator.pull_latest().await;
        let signed_in = match pull.error {
            None => true,
            Some(SyncError::AuthRequired) => false,
            Some(err) => {
                tracing::warn!(error = %err, "dedup aborted, pull failed");
                return Err(err);
            }
        };

        let groups = self
            .local
            .get_groups()
            .await
            .map_err(|e| SyncError::storage(&e))?;

        let guard = self.guard_for(OperationKind::Deduplicate, &groups);
        let operation_id = guard.id().clone();
        let device_id = self.device.current_device_id().await.ok();

        let before: Vec<String> = groups.iter().map(|g| g.id.clone()).collect();
        let report = remove_duplicates(groups, device_id.as_deref()).map_err(|e| {
            tracing::error!(
                operation_id = %operation_id,
                error = %format!("{:#}", e),
                "dedup failed"
            );
            SyncError::storage(&e)
        })?;

        let mut outcome = DedupOutcome {
            removed_count: report.removed_count,
            operation_id: operation_id.clone(),
            pushed: false,
            push_error: None,
        };

        if report.removed_count == 0 {
            tracing::debug!(operation_id = %operation_id, "no duplicate tabs");
            return Ok(outcome);
        }

        self.local
            .set_groups(report.groups.clone())
            .await
            .map_err(|e| SyncError::storage(&e))?;
        let emptied = before
            .into_iter()
            .filter(|id| !report.groups.iter().any(|g| &g.id == id));
        self.orchestrator.record_deletions(emptied);
        self.orchestrator.publish_groups(report.groups);

        if signed_in {
            let push = self.orchestrator.push_only().await;
            outcome.pushed = push.success;
            if let Some(err) = push.error {
                tracing::warn!(operation_id = %operation_id, error = %err, "dedup push failed");
                outcome.push_error = Some(err);
            }
        }

        tracing::info!(
            operation_id = %operation_id,
            removed = outcome.removed_count,
            pushed = outcome.pushed,
            "duplicate tabs removed"
        );
        drop(guard);
        Ok(outcome)
    }
}

fn versions_of(groups: &[Group], group_ids: &[String]) -> HashMap<String, u64> {
    groups
        .iter()
        .filter(|g| group_ids.contains(&g.id))
        .map(|g| (g.id.clone(), g.version))
        .collect()
}
