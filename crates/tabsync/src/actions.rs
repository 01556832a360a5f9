// File: tabsync/src/actions.rs
// Purpose: Protected local mutations of groups and tabs

use std::collections::HashSet;
use std::sync::Arc;

use crate::coordinator::{OperationKind, SyncCoordinator};
use crate::device::DeviceFilter;
use crate::error::SyncError;
use crate::model::{Group, Tab};
use crate::queue::SyncQueue;
use crate::storage::LocalStore;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    #[error("group {0} not found")]
    GroupNotFound(String),

    #[error("tab {tab_id} not found in group {group_id}")]
    TabNotFound { group_id: String, tab_id: String },

    #[error("group {0} is locked")]
    GroupLocked(String),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Local mutations applied immediately and pushed in the background.
///
/// Every mutation runs under a protected operation, bumps the group's version
/// exactly once, persists, and then schedules a debounced push.
pub struct GroupActions {
    coordinator: Arc<SyncCoordinator>,
    local: Arc<dyn LocalStore>,
    device: Arc<DeviceFilter>,
    queue: Option<SyncQueue>,
}

impl GroupActions {
    pub fn new(
        coordinator: Arc<SyncCoordinator>,
        local: Arc<dyn LocalStore>,
        device: Arc<DeviceFilter>,
    ) -> Self {
        Self {
            coordinator,
            local,
            device,
            queue: None,
        }
    }

    /// Schedule a push after each mutation
    pub fn with_queue(mut self, queue: SyncQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub async fn create_group(
        &self,
        name: impl Into<String>,
        tabs: Vec<Tab>,
    ) -> Result<Group, ActionError> {
        let mut group = Group::new(name, tabs);
        let group_id = group.id.clone();

        self.apply(OperationKind::Create, &group_id, |groups, device_id| {
            group.device_id = device_id.map(str::to_string);
            groups.push(group.clone());
            Ok(group)
        })
        .await
    }

    pub async fn rename_group(&self, group_id: &str, name: &str) -> Result<Group, ActionError> {
        self.update(group_id, |group| {
            group.name = name.to_string();
            Ok(())
        })
        .await
    }

    pub async fn set_locked(&self, group_id: &str, locked: bool) -> Result<Group, ActionError> {
        self.update(group_id, |group| {
            group.is_locked = locked;
            Ok(())
        })
        .await
    }

    pub async fn add_tab(&self, group_id: &str, tab: Tab) -> Result<Group, ActionError> {
        self.update(group_id, |group| {
            group.tabs.push(tab);
            Ok(())
        })
        .await
    }

    /// Remove a tab. Returns `None` when the group became empty and was
    /// garbage-collected.
    pub async fn remove_tab(
        &self,
        group_id: &str,
        tab_id: &str,
    ) -> Result<Option<Group>, ActionError> {
        self.apply(OperationKind::Update, group_id, |groups, device_id| {
            let index = find(groups, group_id)?;
            let group = &mut groups[index];

            let before = group.tabs.len();
            group.tabs.retain(|t| t.id != tab_id);
            if group.tabs.len() == before {
                return Err(ActionError::TabNotFound {
                    group_id: group_id.to_string(),
                    tab_id: tab_id.to_string(),
                });
            }

            if group.is_garbage() {
                tracing::debug!(group_id = %group_id, "last tab removed, deleting group");
                groups.remove(index);
                return Ok(None);
            }

            group.touch(device_id);
            Ok(Some(group.clone()))
        })
        .await
    }

    /// Delete a group. Locked groups are refused.
    pub async fn delete_group(&self, group_id: &str) -> Result<(), ActionError> {
        self.apply(OperationKind::Delete, group_id, |groups, _| {
            let index = find(groups, group_id)?;
            if groups[index].is_locked {
                return Err(ActionError::GroupLocked(group_id.to_string()));
            }
            groups.remove(index);
            Ok(())
        })
        .await
    }

    async fn update<F>(&self, group_id: &str, change: F) -> Result<Group, ActionError>
    where
        F: FnOnce(&mut Group) -> Result<(), ActionError>,
    {
        self.apply(OperationKind::Update, group_id, |groups, device_id| {
            let index = find(groups, group_id)?;
            let group = &mut groups[index];
            change(group)?;
            group.touch(device_id);
            Ok(group.clone())
        })
        .await
    }

    async fn apply<T, F>(
        &self,
        kind: OperationKind,
        group_id: &str,
        mutate: F,
    ) -> Result<T, ActionError>
    where
        F: FnOnce(&mut Vec<Group>, Option<&str>) -> Result<T, ActionError>,
    {
        let guard = self
            .coordinator
            .begin_operation(kind, vec![group_id.to_string()])
            .await;

        let device_id = match self.device.current_device_id().await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(
                    error = %format!("{:#}", e),
                    "mutation recorded without device id"
                );
                None
            }
        };

        let mut groups = self
            .local
            .get_groups()
            .await
            .map_err(|e| SyncError::storage(&e))?;
        let before: HashSet<String> = groups.iter().map(|g| g.id.clone()).collect();
        let value = mutate(&mut groups, device_id.as_deref())?;
        self.local
            .set_groups(groups.clone())
            .await
            .map_err(|e| SyncError::storage(&e))?;

        let orchestrator = self.coordinator.orchestrator();
        let removed = before
            .into_iter()
            .filter(|id| !groups.iter().any(|g| &g.id == id));
        orchestrator.record_deletions(removed);
        orchestrator.publish_groups(groups);

        tracing::debug!(
            operation_id = %guard.id(),
            group_id = %group_id,
            kind = kind.as_str(),
            "local mutation applied"
        );
        drop(guard);

        if let Some(queue) = &self.queue {
            queue.schedule_push_only();
        }
        Ok(value)
    }
}

fn find(groups: &[Group], group_id: &str) -> Result<usize, ActionError> {
    groups
        .iter()
        .position(|g| g.id == group_id)
        .ok_or_else(|| ActionError::GroupNotFound(group_id.to_string()))
}
