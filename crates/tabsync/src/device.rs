// File: tabsync/src/device.rs
// Purpose: Device identity and loopback filtering of realtime events

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::SyncConfig;
use crate::realtime::{ChangeEvent, RawChangeEvent};
use crate::storage::DeviceIdentityStore;

static DEVICE_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{10,100}$").unwrap());

const RANDOM_SUFFIX_LEN: usize = 9;

/// Check the device id format: 10-100 chars of `[A-Za-z0-9_-]`
pub fn is_valid_device_id(id: &str) -> bool {
    DEVICE_ID_REGEX.is_match(id)
}

/// Build a new identifier: platform tag, millisecond timestamp, random suffix
pub fn generate_device_id(platform_tag: &str) -> String {
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(RANDOM_SUFFIX_LEN)
        .collect();
    format!(
        "{}_{}_{}",
        platform_tag,
        chrono::Utc::now().timestamp_millis(),
        suffix
    )
}

/// Why an event was kept or dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    /// Legacy or unknown origin; processed permissively
    NoDeviceId,
    /// Written by this device
    OwnDevice,
    InvalidDeviceId,
    ForeignDevice,
    /// The local identity could not be read
    IdentityUnavailable,
    /// The raw payload could not be decoded
    InvalidPayload,
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterReason::NoDeviceId => "no device id",
            FilterReason::OwnDevice => "own device",
            FilterReason::InvalidDeviceId => "invalid device id",
            FilterReason::ForeignDevice => "other device",
            FilterReason::IdentityUnavailable => "identity unavailable",
            FilterReason::InvalidPayload => "invalid payload",
        }
    }
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`DeviceFilter::should_process`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterDecision {
    pub process: bool,
    pub reason: FilterReason,
}

impl FilterDecision {
    fn keep(reason: FilterReason) -> Self {
        Self { process: true, reason }
    }

    fn reject(reason: FilterReason) -> Self {
        Self { process: false, reason }
    }
}

/// Recognizes realtime notifications about this device's own writes.
pub struct DeviceFilter {
    store: Arc<dyn DeviceIdentityStore>,
    platform_tag: String,
    ttl: Duration,
    cache: Mutex<Option<(String, Instant)>>,
}

impl DeviceFilter {
    pub fn new(store: Arc<dyn DeviceIdentityStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            platform_tag: config.platform_tag.clone(),
            ttl: config.device_cache_ttl(),
            cache: Mutex::new(None),
        }
    }

    /// The persisted identifier of this device.
    ///
    /// Served from cache for the configured TTL. On a miss the primary slot is
    /// read; a missing or malformed primary is restored from the backup slot,
    /// and if both are unusable a fresh id is generated and written to both.
    pub async fn current_device_id(&self) -> Result<String> {
        // Held across the load so concurrent callers never generate two ids
        let mut cache = self.cache.lock().await;

        if let Some((id, cached_at)) = cache.as_ref() {
            if cached_at.elapsed() < self.ttl {
                return Ok(id.clone());
            }
        }

        let id = self.load_or_create().await?;
        *cache = Some((id.clone(), Instant::now()));
        Ok(id)
    }

    /// Drop the cached id so the next call re-reads storage
    pub async fn invalidate_cache(&self) {
        *self.cache.lock().await = None;
    }

    async fn load_or_create(&self) -> Result<String> {
        let primary = self
            .store
            .get_primary()
            .await
            .context("Failed to read device id")?;

        if let Some(id) = primary.filter(|id| is_valid_device_id(id)) {
            self.ensure_backup(&id).await;
            return Ok(id);
        }

        let backup = self
            .store
            .get_backup()
            .await
            .context("Failed to read device id backup")?;

        if let Some(id) = backup.filter(|id| is_valid_device_id(id)) {
            tracing::warn!(
                device_id = %id,
                "primary device id missing or corrupted, restored from backup"
            );
            self.store
                .set_primary(&id)
                .await
                .context("Failed to restore device id")?;
            return Ok(id);
        }

        let id = generate_device_id(&self.platform_tag);
        futures::try_join!(
            async {
                self.store
                    .set_primary(&id)
                    .await
                    .context("Failed to persist device id")
            },
            async {
                self.store
                    .set_backup(&id)
                    .await
                    .context("Failed to persist device id backup")
            }
        )?;
        tracing::info!(device_id = %id, "generated new device id");
        Ok(id)
    }

    async fn ensure_backup(&self, id: &str) {
        let current = self.store.get_backup().await.ok().flatten();
        if current.as_deref() == Some(id) {
            return;
        }
        if let Err(e) = self.store.set_backup(id).await {
            tracing::warn!(error = %e, "failed to write device id backup");
        }
    }

    /// Decide whether a realtime event should be processed.
    ///
    /// Fails closed: if the local identity can't be read the event is dropped.
    pub async fn should_process(&self, event: &ChangeEvent) -> FilterDecision {
        let Some(origin) = event.origin_device_id() else {
            return FilterDecision::keep(FilterReason::NoDeviceId);
        };

        let current = match self.current_device_id().await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "dropping realtime event, device identity unavailable");
                return FilterDecision::reject(FilterReason::IdentityUnavailable);
            }
        };

        if origin == current {
            return FilterDecision::reject(FilterReason::OwnDevice);
        }

        if !is_valid_device_id(origin) {
            tracing::debug!(origin = %origin, "dropping realtime event with malformed device id");
            return FilterDecision::reject(FilterReason::InvalidDeviceId);
        }

        FilterDecision::keep(FilterReason::ForeignDevice)
    }

    /// Decode and filter an event straight from the transport
    pub async fn should_process_raw(&self, raw: RawChangeEvent) -> FilterDecision {
        match ChangeEvent::try_from(raw) {
            Ok(event) => self.should_process(&event).await,
            Err(e) => {
                tracing::debug!(error = %e, "dropping undecodable realtime event");
                FilterDecision::reject(FilterReason::InvalidPayload)
            }
        }
    }
}
