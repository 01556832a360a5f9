// File: tabsync/src/judge.rs
// Purpose: Adaptive policy deciding whether and when a change triggers a sync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::config::SyncConfig;
use crate::model::Group;

const MAX_PENDING_OPERATIONS: usize = 3;
const MIN_SYNC_INTERVAL_MS: i64 = 1000;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(1000);
const POOR_NETWORK_RETRY_DELAY: Duration = Duration::from_millis(5000);
const THRASH_CHANGE_COUNT: usize = 10;
const BULK_GROUP_COUNT: usize = 5;
const BULK_TAB_COUNT: usize = 10;
const LOW_BATTERY: f32 = 0.2;
const HIGH_MEMORY_PRESSURE: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// A local or remote change offered to the judge
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeInfo {
    pub kind: ChangeKind,
    pub affected_groups: usize,
    pub affected_tabs: usize,
    pub timestamp: DateTime<Utc>,
    /// Copies of the group before and after, when known (updates only)
    pub local: Option<Group>,
    pub remote: Option<Group>,
}

impl ChangeInfo {
    pub fn new(kind: ChangeKind, affected_groups: usize, affected_tabs: usize) -> Self {
        Self {
            kind,
            affected_groups,
            affected_tabs,
            timestamp: Utc::now(),
            local: None,
            remote: None,
        }
    }

    pub fn with_snapshots(mut self, local: Option<Group>, remote: Option<Group>) -> Self {
        self.local = local;
        self.remote = remote;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        }
    }

    fn from_rank(rank: u8) -> Self {
        match rank {
            0 => Priority::Low,
            1 => Priority::Medium,
            _ => Priority::High,
        }
    }

    fn base_delay(self) -> Duration {
        match self {
            Priority::High => Duration::from_millis(100),
            Priority::Medium => Duration::from_millis(500),
            Priority::Low => Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NetworkQuality {
    Excellent,
    #[default]
    Good,
    Fair,
    Poor,
}

impl NetworkQuality {
    fn delay_factor(self) -> f64 {
        match self {
            NetworkQuality::Excellent | NetworkQuality::Good => 1.0,
            NetworkQuality::Fair => 1.5,
            NetworkQuality::Poor => 2.0,
        }
    }
}

/// Environment signals at judgment time
#[derive(Debug, Clone, PartialEq)]
pub struct SystemState {
    pub pending_operations: usize,
    pub network: NetworkQuality,
    pub last_sync: Option<DateTime<Utc>>,
    /// 0.0 to 1.0, `None` when unknown or on mains power
    pub battery_level: Option<f32>,
    /// 0.0 to 1.0
    pub memory_pressure: Option<f32>,
    pub user_active: bool,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            pending_operations: 0,
            network: NetworkQuality::Good,
            last_sync: None,
            battery_level: None,
            memory_pressure: None,
            user_active: true,
        }
    }
}

/// Source of [`SystemState`] for hosts that can measure it
pub trait SystemStateProvider: Send + Sync {
    fn system_state(&self) -> SystemState;
}

/// Provider returning whatever was last set
#[derive(Debug, Default)]
pub struct StaticSystemState {
    state: Mutex<SystemState>,
}

impl StaticSystemState {
    pub fn new(state: SystemState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn set(&self, state: SystemState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

impl SystemStateProvider for StaticSystemState {
    fn system_state(&self) -> SystemState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Judgment {
    pub should_sync: bool,
    pub priority: Priority,
    pub recommended_delay: Duration,
}

impl Judgment {
    fn wait(delay: Duration) -> Self {
        Self {
            should_sync: false,
            priority: Priority::Low,
            recommended_delay: delay,
        }
    }

    fn sync(priority: Priority, delay: Duration) -> Self {
        Self {
            should_sync: true,
            priority,
            recommended_delay: delay,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RecordedChange {
    timestamp: DateTime<Utc>,
}

/// Decides whether a change is worth a network round trip now
pub struct SmartSyncJudge {
    history: Mutex<VecDeque<RecordedChange>>,
    capacity: usize,
    window: chrono::Duration,
    skew_threshold: chrono::Duration,
}

impl Default for SmartSyncJudge {
    fn default() -> Self {
        Self::new(&SyncConfig::default())
    }
}

impl SmartSyncJudge {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity)),
            capacity: config.history_capacity,
            window: config.history_window(),
            skew_threshold: chrono::Duration::minutes(1),
        }
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<RecordedChange>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `change` and count the changes inside the sliding window
    fn record(&self, change: &ChangeInfo) -> usize {
        let mut history = self.history();
        if history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(RecordedChange {
            timestamp: change.timestamp,
        });

        let cutoff = Utc::now() - self.window;
        while history.front().is_some_and(|c| c.timestamp < cutoff) {
            history.pop_front();
        }
        history.iter().filter(|c| c.timestamp >= cutoff).count()
    }

    pub fn recent_changes(&self) -> usize {
        let cutoff = Utc::now() - self.window;
        self.history()
            .iter()
            .filter(|c| c.timestamp >= cutoff)
            .count()
    }

    pub fn should_sync(&self, change: ChangeInfo, system: &SystemState) -> Judgment {
        let recent = self.record(&change);

        if let Some(judgment) = self.basic_gate(system) {
            tracing::debug!(?judgment, "sync deferred by basic gate");
            return judgment;
        }

        let scale = system.network.delay_factor();

        if recent > THRASH_CHANGE_COUNT {
            tracing::debug!(recent, "frequent changes, deprioritizing sync");
            return Judgment::sync(Priority::Low, Priority::Low.base_delay());
        }
        if change.affected_groups > BULK_GROUP_COUNT {
            return Judgment::sync(Priority::High, scaled(Priority::High.base_delay(), scale));
        }

        let importance = self.importance(&change);
        let priority = match resource_vote(system) {
            Some(resource) => Priority::from_rank((importance.rank() + resource.rank()) / 2),
            None => importance,
        };

        Judgment::sync(priority, scaled(priority.base_delay(), scale))
    }

    fn basic_gate(&self, system: &SystemState) -> Option<Judgment> {
        if system.pending_operations > MAX_PENDING_OPERATIONS {
            return Some(Judgment::wait(BUSY_RETRY_DELAY));
        }
        if system.network == NetworkQuality::Poor {
            return Some(Judgment::wait(POOR_NETWORK_RETRY_DELAY));
        }
        if let Some(last_sync) = system.last_sync {
            let since = Utc::now() - last_sync;
            if since < chrono::Duration::milliseconds(MIN_SYNC_INTERVAL_MS) {
                let remaining = (MIN_SYNC_INTERVAL_MS - since.num_milliseconds()).max(0) as u64;
                let delay = if remaining == 0 {
                    Duration::from_millis(MIN_SYNC_INTERVAL_MS as u64)
                } else {
                    Duration::from_millis(remaining)
                };
                return Some(Judgment::wait(delay));
            }
        }
        None
    }

    fn importance(&self, change: &ChangeInfo) -> Priority {
        if change.affected_tabs > BULK_TAB_COUNT {
            return Priority::High;
        }
        match change.kind {
            ChangeKind::Delete => Priority::High,
            ChangeKind::Create => Priority::Medium,
            ChangeKind::Update => match (&change.local, &change.remote) {
                (Some(local), Some(remote)) if self.differs(local, remote) => Priority::High,
                (Some(_), Some(_)) => Priority::Low,
                _ => Priority::Medium,
            },
        }
    }

    fn differs(&self, local: &Group, remote: &Group) -> bool {
        let (a, b) = (local.updated_time(), remote.updated_time());
        let skew = if a > b { a - b } else { b - a };
        local.name != remote.name
            || local.is_locked != remote.is_locked
            || local.tabs.len() != remote.tabs.len()
            || skew > self.skew_threshold
    }
}

/// `Some(Low)` under battery, memory or idle-user pressure, otherwise no vote
fn resource_vote(system: &SystemState) -> Option<Priority> {
    let low_battery = system.battery_level.is_some_and(|b| b < LOW_BATTERY);
    let memory_pressure = system.memory_pressure.is_some_and(|m| m > HIGH_MEMORY_PRESSURE);
    (low_battery || memory_pressure || !system.user_active).then_some(Priority::Low)
}

fn scaled(delay: Duration, factor: f64) -> Duration {
    delay.mul_f64(factor)
}
