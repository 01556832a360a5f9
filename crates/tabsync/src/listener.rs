// File: tabsync/src/listener.rs
// Purpose: Realtime consumer: loopback filter, protection check, judge, schedule

use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::coordinator::{PendingOperations, SyncCoordinator};
use crate::device::{DeviceFilter, FilterReason};
use crate::judge::{ChangeInfo, ChangeKind, Judgment, SmartSyncJudge, SystemStateProvider};
use crate::model::Group;
use crate::orchestrator::SyncOrchestrator;
use crate::queue::SyncQueue;
use crate::realtime::{ChangeEvent, RawChangeEvent};
use crate::storage::LocalStore;

/// Delay for the catch-up sync after the receiver lagged behind
const LAG_RESYNC_DELAY: Duration = Duration::from_millis(500);

/// What happened to one realtime event
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerOutcome {
    Ignored(FilterReason),
    /// The group is under local protection; a sync was scheduled for after the window
    Deferred { group_id: String },
    /// A sync was scheduled after the judgment's delay. `should_sync == false`
    /// means the judge asked to retry later rather than now.
    Scheduled(Judgment),
}

pub struct RealtimeListener {
    filter: Arc<DeviceFilter>,
    pending: Arc<PendingOperations>,
    orchestrator: Arc<SyncOrchestrator>,
    judge: Arc<SmartSyncJudge>,
    queue: SyncQueue,
    local: Arc<dyn LocalStore>,
    system: Arc<dyn SystemStateProvider>,
}

impl RealtimeListener {
    pub fn new(
        coordinator: &SyncCoordinator,
        filter: Arc<DeviceFilter>,
        judge: Arc<SmartSyncJudge>,
        queue: SyncQueue,
        local: Arc<dyn LocalStore>,
        system: Arc<dyn SystemStateProvider>,
    ) -> Self {
        Self {
            filter,
            pending: coordinator.pending().clone(),
            orchestrator: coordinator.orchestrator().clone(),
            judge,
            queue,
            local,
            system,
        }
    }

    pub fn spawn(self, rx: broadcast::Receiver<RawChangeEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    /// Consume events until the sender side closes
    pub async fn run(self, mut rx: broadcast::Receiver<RawChangeEvent>) {
        tracing::info!("realtime listener started");
        loop {
            match rx.recv().await {
                Ok(raw) => {
                    let outcome = self.handle(raw).await;
                    tracing::trace!(?outcome, "realtime event handled");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "realtime listener lagged, scheduling catch-up sync");
                    self.queue.schedule_sync(LAG_RESYNC_DELAY);
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::info!("realtime listener stopped");
    }

    pub async fn handle(&self, raw: RawChangeEvent) -> ListenerOutcome {
        let event = match ChangeEvent::try_from(raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "ignoring undecodable realtime event");
                return ListenerOutcome::Ignored(FilterReason::InvalidPayload);
            }
        };

        let decision = self.filter.should_process(&event).await;
        if !decision.process {
            tracing::debug!(reason = %decision.reason, "realtime event filtered");
            return ListenerOutcome::Ignored(decision.reason);
        }

        if let Some(group_id) = event.group_id() {
            if self.pending.is_protected(group_id) {
                tracing::debug!(group_id = %group_id, "group protected, deferring remote change");
                self.queue.schedule_sync(self.pending.timeout());
                return ListenerOutcome::Deferred {
                    group_id: group_id.to_string(),
                };
            }
        }

        let change = self.describe(&event).await;
        let mut system = self.system.system_state();
        system.pending_operations = self.pending.len();
        system.last_sync = self.orchestrator.last_sync().or(system.last_sync);

        let judgment = self.judge.should_sync(change, &system);
        tracing::debug!(
            group_id = event.group_id().unwrap_or(""),
            should_sync = judgment.should_sync,
            priority = ?judgment.priority,
            delay_ms = judgment.recommended_delay.as_millis() as u64,
            "remote change judged"
        );
        self.queue.schedule_sync(judgment.recommended_delay);
        ListenerOutcome::Scheduled(judgment)
    }

    async fn describe(&self, event: &ChangeEvent) -> ChangeInfo {
        let record = event.source_record();
        let affected_tabs = record
            .data
            .get("tabs")
            .and_then(JsonValue::as_array)
            .map_or(0, Vec::len);

        let kind = match event {
            ChangeEvent::Insert(_) => ChangeKind::Create,
            ChangeEvent::Update { .. } => ChangeKind::Update,
            ChangeEvent::Delete(_) => ChangeKind::Delete,
        };
        let info = ChangeInfo::new(kind, 1, affected_tabs);
        if kind != ChangeKind::Update {
            return info;
        }

        let remote: Option<Group> =
            serde_json::from_value(JsonValue::Object(record.data.clone())).ok();
        let local = match (event.group_id(), self.local.get_groups().await) {
            (Some(id), Ok(groups)) => groups.into_iter().find(|g| g.id == id),
            (_, Err(e)) => {
                tracing::warn!(
                    error = %format!("{:#}", e),
                    "could not read local copy for judgment"
                );
                None
            }
            (None, Ok(_)) => None,
        };
        info.with_snapshots(local, remote)
    }
}
