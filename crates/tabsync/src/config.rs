// File: tabsync/src/config.rs
// Purpose: Sync configuration and TOML loading

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Tunable thresholds and timings for the sync engine.
///
/// The conflict thresholds are product heuristics, not derived invariants;
/// they are kept here so hosts can tune them without touching the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How long a protected operation may block conflicting remote updates
    #[serde(default = "default_protection_timeout_ms")]
    pub protection_timeout_ms: u64,

    /// Timestamp gap beyond which one side wins outright
    #[serde(default = "default_conflict_window_secs")]
    pub conflict_window_secs: u64,

    /// Timestamp gap that flags `UpdatedAt` as conflicting
    #[serde(default = "default_skew_threshold_secs")]
    pub skew_threshold_secs: u64,

    #[serde(default = "default_device_cache_ttl_secs")]
    pub device_cache_ttl_secs: u64,

    /// Maximum number of changes the judge remembers
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default = "default_history_window_secs")]
    pub history_window_secs: u64,

    /// Deadline for a single download/upload call
    #[serde(default = "default_network_timeout_ms")]
    pub network_timeout_ms: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_unit_ms")]
    pub retry_unit_ms: u64,

    #[serde(default = "default_push_debounce_ms")]
    pub push_debounce_ms: u64,

    /// Prefix for generated device identifiers
    #[serde(default = "default_platform_tag")]
    pub platform_tag: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            protection_timeout_ms: default_protection_timeout_ms(),
            conflict_window_secs: default_conflict_window_secs(),
            skew_threshold_secs: default_skew_threshold_secs(),
            device_cache_ttl_secs: default_device_cache_ttl_secs(),
            history_capacity: default_history_capacity(),
            history_window_secs: default_history_window_secs(),
            network_timeout_ms: default_network_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_unit_ms: default_retry_unit_ms(),
            push_debounce_ms: default_push_debounce_ms(),
            platform_tag: default_platform_tag(),
        }
    }
}

/// Wrapper used when the sync settings live under `[sync]` in an app config
#[derive(Debug, Deserialize)]
struct AppToml {
    #[serde(default)]
    sync: SyncConfig,
}

impl SyncConfig {
    /// Parse a TOML document whose top level is the sync table
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SyncConfig =
            toml::from_str(content).context("Failed to parse sync config")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the `[sync]` table of a larger application config
    pub fn from_app_toml(content: &str) -> Result<Self> {
        let app: AppToml = toml::from_str(content).context("Failed to parse app config")?;
        app.sync.validate()?;
        Ok(app.sync)
    }

    /// Load from a file, falling back to defaults if it doesn't exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "sync config not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.protection_timeout_ms == 0 {
            anyhow::bail!("protection_timeout_ms must be greater than zero");
        }
        if self.network_timeout_ms == 0 {
            anyhow::bail!("network_timeout_ms must be greater than zero");
        }
        if self.history_capacity == 0 {
            anyhow::bail!("history_capacity must be greater than zero");
        }
        if self.platform_tag.is_empty()
            || !self
                .platform_tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            anyhow::bail!("platform_tag must be non-empty and use [A-Za-z0-9_-]");
        }
        Ok(())
    }

    pub fn protection_timeout(&self) -> Duration {
        Duration::from_millis(self.protection_timeout_ms)
    }

    pub fn conflict_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.conflict_window_secs as i64)
    }

    pub fn skew_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.skew_threshold_secs as i64)
    }

    pub fn device_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.device_cache_ttl_secs)
    }

    pub fn history_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.history_window_secs as i64)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn retry_unit(&self) -> Duration {
        Duration::from_millis(self.retry_unit_ms)
    }

    pub fn push_debounce(&self) -> Duration {
        Duration::from_millis(self.push_debounce_ms)
    }
}

// Default values
fn default_protection_timeout_ms() -> u64 {
    10_000
}

fn default_conflict_window_secs() -> u64 {
    30
}

fn default_skew_threshold_secs() -> u64 {
    60
}

fn default_device_cache_ttl_secs() -> u64 {
    300
}

fn default_history_capacity() -> usize {
    50
}

fn default_history_window_secs() -> u64 {
    300
}

fn default_network_timeout_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_unit_ms() -> u64 {
    1_000
}

fn default_push_debounce_ms() -> u64 {
    1_000
}

fn default_platform_tag() -> String {
    std::env::consts::OS.to_string()
}
