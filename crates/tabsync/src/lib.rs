// File: tabsync/src/lib.rs
// Purpose: Main entry point for the tabsync library

//! # tabsync
//!
//! Pull-first synchronization of tab groups across devices that share one
//! remote store without a lock server.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tabsync::{
//!     DeviceFilter, GroupActions, PendingOperations, RealtimeHub, RealtimeListener,
//!     SmartSyncJudge, StaticSystemState, SyncConfig, SyncCoordinator, SyncOrchestrator,
//!     SyncQueue,
//! };
//!
//! let config = SyncConfig::load("tabsync.toml")?;
//! let pending = PendingOperations::from_config(&config);
//! let orchestrator = Arc::new(SyncOrchestrator::new(
//!     local.clone(), remote, auth, pending.clone(), &config,
//! ));
//! let device = Arc::new(DeviceFilter::new(identity, &config));
//! let coordinator = Arc::new(SyncCoordinator::new(
//!     pending, orchestrator.clone(), local.clone(), device.clone(),
//! ));
//! let (queue, _worker) = SyncQueue::start(orchestrator, &config);
//!
//! // local edits apply immediately and push in the background
//! let actions = GroupActions::new(coordinator.clone(), local.clone(), device.clone())
//!     .with_queue(queue.clone());
//! actions.create_group("Reading", tabs).await?;
//!
//! // remote edits arrive through the realtime hub
//! let hub = RealtimeHub::default();
//! RealtimeListener::new(
//!     &coordinator, device, Arc::new(SmartSyncJudge::new(&config)), queue, local,
//!     Arc::new(StaticSystemState::default()),
//! )
//! .spawn(hub.subscribe());
//! ```

pub mod actions;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod dedup;
pub mod device;
pub mod error;
pub mod judge;
pub mod listener;
pub mod model;
pub mod observer;
pub mod orchestrator;
pub mod queue;
pub mod realtime;
pub mod retry;
pub mod storage;

// Re-export main types
pub use actions::{ActionError, GroupActions};
pub use config::SyncConfig;
pub use conflict::{ConflictField, ConflictRecord, ConflictResolver, Resolution, ResolutionStrategy};
pub use coordinator::{
    DedupOutcome, OperationGuard, OperationId, OperationKind, PendingOperation, PendingOperations,
    SyncCoordinator,
};
pub use dedup::{remove_duplicates, DedupReport};
pub use device::{DeviceFilter, FilterDecision, FilterReason};
pub use error::{Result, SyncError};
pub use judge::{
    ChangeInfo, ChangeKind, Judgment, NetworkQuality, Priority, SmartSyncJudge, StaticSystemState,
    SystemState, SystemStateProvider,
};
pub use listener::{ListenerOutcome, RealtimeListener};
pub use model::{normalize_url, Group, Tab};
pub use observer::{StageSnapshot, SyncObserver, SyncStage, TracingObserver};
pub use orchestrator::{SyncOrchestrator, SyncResult, SyncState, SyncStats};
pub use queue::{SyncQueue, SyncTask};
pub use realtime::{ChangeEvent, ChangeRecord, RawChangeEvent, RawEventKind, RealtimeHub};
pub use storage::{AuthProvider, DeviceIdentityStore, LocalStore, RemoteClient};
