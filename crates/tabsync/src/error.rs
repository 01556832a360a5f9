// File: tabsync/src/error.rs
// Purpose: Error taxonomy for sync orchestration

use std::time::Duration;

/// Errors surfaced by the orchestrator, coordinator and queue.
///
/// Collaborators (stores, remote clients) report `anyhow::Error`; those are
/// folded into one of these variants at the orchestration boundary so callers
/// can decide whether to retry, prompt, or stay silent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Not signed in. Callers treat this as a silent no-op.
    #[error("authentication required")]
    AuthRequired,

    /// Another orchestration holds the sync flag.
    #[error("sync already in progress")]
    AlreadyInProgress,

    #[error("network failure after {retries} retries: {message}")]
    Network { message: String, retries: u32 },

    /// Conflicts that need a user decision.
    #[error("{count} conflict(s) need manual resolution")]
    ConflictUnresolved { count: usize },

    #[error("local storage failure: {0}")]
    Storage(String),

    #[error("network call exceeded {0:?}")]
    Timeout(Duration),

    #[error("invalid change event: {0}")]
    InvalidEvent(String),
}

impl SyncError {
    pub fn network(err: &anyhow::Error, retries: u32) -> Self {
        SyncError::Network {
            message: format!("{:#}", err),
            retries,
        }
    }

    pub fn storage(err: &anyhow::Error) -> Self {
        SyncError::Storage(format!("{:#}", err))
    }

    /// Whether a later attempt may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network { .. } | SyncError::Timeout(_) | SyncError::AlreadyInProgress
        )
    }

    /// Whether the failure should be hidden from the user entirely.
    pub fn is_silent(&self) -> bool {
        matches!(self, SyncError::AuthRequired)
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
