// File: tabsync/src/queue.rs
// Purpose: FIFO of deferred sync requests drained by a single worker

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::orchestrator::{SyncOrchestrator, SyncResult};

/// A deferred sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTask {
    /// Pull-first sync after `delay`
    Sync { delay: Duration },
    /// Debounced push-only sync
    PushOnly,
}

impl SyncTask {
    /// Whether running `self` makes a later `other` redundant.
    /// A pull-first sync also pushes, so it absorbs push-only requests.
    fn absorbs(&self, other: &SyncTask) -> bool {
        match (self, other) {
            (SyncTask::Sync { .. }, _) => true,
            (SyncTask::PushOnly, SyncTask::PushOnly) => true,
            (SyncTask::PushOnly, SyncTask::Sync { .. }) => false,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SyncTask::Sync { .. } => "sync",
            SyncTask::PushOnly => "push_only",
        }
    }
}

#[derive(Default)]
struct QueueStatus {
    draining: AtomicBool,
    queued: AtomicUsize,
    processed: AtomicUsize,
    coalesced: AtomicUsize,
}

/// Handle for scheduling syncs. Cheap to clone; the worker stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct SyncQueue {
    tx: mpsc::UnboundedSender<SyncTask>,
    status: Arc<QueueStatus>,
}

impl SyncQueue {
    /// Spawn the worker on the current runtime
    pub fn start(
        orchestrator: Arc<SyncOrchestrator>,
        config: &SyncConfig,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let status = Arc::new(QueueStatus::default());

        let worker = Worker {
            rx,
            orchestrator,
            status: status.clone(),
            debounce: config.push_debounce(),
            backlog: VecDeque::new(),
        };
        let handle = tokio::spawn(worker.run());

        (Self { tx, status }, handle)
    }

    pub fn schedule_sync(&self, delay: Duration) -> bool {
        self.enqueue(SyncTask::Sync { delay })
    }

    pub fn schedule_push_only(&self) -> bool {
        self.enqueue(SyncTask::PushOnly)
    }

    fn enqueue(&self, task: SyncTask) -> bool {
        self.status.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(task).is_err() {
            self.status.queued.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(task = task.name(), "sync queue worker has stopped");
            return false;
        }
        true
    }

    pub fn is_draining(&self) -> bool {
        self.status.draining.load(Ordering::SeqCst)
    }

    /// Requests accepted but not yet run or absorbed
    pub fn queued(&self) -> usize {
        self.status.queued.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> usize {
        self.status.processed.load(Ordering::SeqCst)
    }

    pub fn coalesced(&self) -> usize {
        self.status.coalesced.load(Ordering::SeqCst)
    }

    /// Wait until every accepted request has been run or absorbed
    pub async fn wait_idle(&self) {
        while self.queued() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

struct Worker {
    rx: mpsc::UnboundedReceiver<SyncTask>,
    orchestrator: Arc<SyncOrchestrator>,
    status: Arc<QueueStatus>,
    debounce: Duration,
    backlog: VecDeque<SyncTask>,
}

impl Worker {
    async fn run(mut self) {
        tracing::debug!("sync queue worker started");
        while let Some(task) = self.next().await {
            self.status.draining.store(true, Ordering::SeqCst);

            let wait = match task {
                SyncTask::Sync { delay } => delay,
                SyncTask::PushOnly => self.debounce,
            };
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            self.absorb_arrivals(&task);

            let result = match task {
                SyncTask::Sync { .. } => self.orchestrator.pull_first().await,
                SyncTask::PushOnly => self.orchestrator.push_only().await,
            };
            log_result(&task, &result);

            self.status.processed.fetch_add(1, Ordering::SeqCst);
            self.status.queued.fetch_sub(1, Ordering::SeqCst);
            if self.backlog.is_empty() {
                self.status.draining.store(false, Ordering::SeqCst);
            }
        }
        self.status.draining.store(false, Ordering::SeqCst);
        tracing::debug!("sync queue worker stopped");
    }

    async fn next(&mut self) -> Option<SyncTask> {
        match self.backlog.pop_front() {
            Some(task) => Some(task),
            None => self.rx.recv().await,
        }
    }

    /// Move requests that arrived while waiting into the backlog, dropping
    /// the ones `task` makes redundant
    fn absorb_arrivals(&mut self, task: &SyncTask) {
        while let Ok(next) = self.rx.try_recv() {
            self.backlog.push_back(next);
        }

        let before = self.backlog.len();
        self.backlog.retain(|next| !task.absorbs(next));
        let absorbed = before - self.backlog.len();
        if absorbed > 0 {
            self.status.coalesced.fetch_add(absorbed, Ordering::SeqCst);
            self.status.queued.fetch_sub(absorbed, Ordering::SeqCst);
            tracing::debug!(task = task.name(), absorbed, "coalesced queued sync requests");
        }
    }
}

fn log_result(task: &SyncTask, result: &SyncResult) {
    match &result.error {
        None => tracing::debug!(task = task.name(), "queued sync finished"),
        Some(err) if err.is_silent() || *err == SyncError::AlreadyInProgress => {
            tracing::debug!(task = task.name(), error = %err, "queued sync skipped")
        }
        Some(err) => tracing::warn!(task = task.name(), error = %err, "queued sync failed"),
    }
}
