//! In-memory backends
//!
//! Fast but non-persistent. Used by tests and by hosts that keep state
//! elsewhere. The remote double tracks how many records each upload actually
//! changed so idempotence can be asserted.

use crate::model::Group;
use crate::storage::{AuthProvider, DeviceIdentityStore, LocalStore, RemoteClient};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// In-memory local store
#[derive(Clone, Default)]
pub struct MemoryLocalStore {
    groups: Arc<RwLock<Vec<Group>>>,
    fail: Arc<AtomicBool>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_groups(groups: Vec<Group>) -> Self {
        Self {
            groups: Arc::new(RwLock::new(groups)),
            fail: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every read and write fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> Vec<Group> {
        self.groups.read().await.clone()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get_groups(&self) -> Result<Vec<Group>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("local store unavailable");
        }
        Ok(self.groups.read().await.clone())
    }

    async fn set_groups(&self, groups: Vec<Group>) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("local store unavailable");
        }
        *self.groups.write().await = groups;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Counters describing what uploads did to the remote set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStats {
    pub downloads: usize,
    pub uploads: usize,
    /// Records inserted or replaced with different content
    pub changed: usize,
    pub deleted: usize,
}

/// In-memory remote backend with failure injection
#[derive(Clone, Default)]
pub struct MemoryRemote {
    groups: Arc<RwLock<Vec<Group>>>,
    downloads: Arc<AtomicUsize>,
    uploads: Arc<AtomicUsize>,
    changed: Arc<AtomicUsize>,
    deleted: Arc<AtomicUsize>,
    failures_left: Arc<AtomicU32>,
    upload_failures_left: Arc<AtomicU32>,
    latency: Arc<std::sync::Mutex<Option<Duration>>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_groups(groups: Vec<Group>) -> Self {
        Self {
            groups: Arc::new(RwLock::new(groups)),
            ..Self::default()
        }
    }

    /// Fail the next `count` calls with a network error
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` uploads only; downloads keep working
    pub fn fail_uploads(&self, count: u32) {
        self.upload_failures_left.store(count, Ordering::SeqCst);
    }

    /// Delay every call, to hold an orchestration open in tests
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    pub async fn snapshot(&self) -> Vec<Group> {
        self.groups.read().await.clone()
    }

    pub async fn replace(&self, groups: Vec<Group>) {
        *self.groups.write().await = groups;
    }

    pub fn stats(&self) -> RemoteStats {
        RemoteStats {
            downloads: self.downloads.load(Ordering::SeqCst),
            uploads: self.uploads.load(Ordering::SeqCst),
            changed: self.changed.load(Ordering::SeqCst),
            deleted: self.deleted.load(Ordering::SeqCst),
        }
    }

    async fn before_call(&self) -> Result<()> {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if take_one(&self.failures_left) {
            anyhow::bail!("remote unreachable");
        }
        Ok(())
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn download_groups(&self) -> Result<Vec<Group>> {
        self.before_call().await?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(self.groups.read().await.clone())
    }

    async fn upload_groups(&self, groups: Vec<Group>, overwrite: bool) -> Result<()> {
        self.before_call().await?;
        if take_one(&self.upload_failures_left) {
            anyhow::bail!("upload rejected");
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);

        let mut remote = self.groups.write().await;

        if overwrite {
            let before = remote.len();
            remote.retain(|r| groups.iter().any(|g| g.id == r.id));
            self.deleted.fetch_add(before - remote.len(), Ordering::SeqCst);
        }

        for group in &groups {
            match remote.iter_mut().find(|r| r.id == group.id) {
                Some(existing) if existing == group => {}
                Some(existing) => {
                    *existing = group.clone();
                    self.changed.fetch_add(1, Ordering::SeqCst);
                }
                None => {
                    remote.push(group.clone());
                    self.changed.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        // an overwrite leaves the remote identical to the upload, order included
        if overwrite {
            *remote = groups;
        }

        Ok(())
    }
}

/// Fixed authentication state that can be flipped at runtime
#[derive(Clone)]
pub struct StaticAuth {
    authenticated: Arc<AtomicBool>,
}

impl StaticAuth {
    pub fn new(authenticated: bool) -> Self {
        Self {
            authenticated: Arc::new(AtomicBool::new(authenticated)),
        }
    }

    pub fn set(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }
}

impl AuthProvider for StaticAuth {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}

/// In-memory device identity slots
#[derive(Clone, Default)]
pub struct MemoryIdentityStore {
    primary: Arc<RwLock<Option<String>>>,
    backup: Arc<RwLock<Option<String>>>,
    fail: Arc<AtomicBool>,
    reads: Arc<AtomicUsize>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    /// Number of primary-slot reads, to observe caching
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("identity storage unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceIdentityStore for MemoryIdentityStore {
    async fn get_primary(&self) -> Result<Option<String>> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.primary.read().await.clone())
    }

    async fn set_primary(&self, device_id: &str) -> Result<()> {
        self.check()?;
        *self.primary.write().await = Some(device_id.to_string());
        Ok(())
    }

    async fn get_backup(&self) -> Result<Option<String>> {
        self.check()?;
        Ok(self.backup.read().await.clone())
    }

    async fn set_backup(&self, device_id: &str) -> Result<()> {
        self.check()?;
        *self.backup.write().await = Some(device_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tab;

    #[tokio::test]
    async fn test_overwrite_upload_mirrors_local_set() {
        let keep = Group::new("Keep", vec![Tab::new("https://a.dev", "a")]);
        let stale = Group::new("Stale", vec![Tab::new("https://b.dev", "b")]);
        let remote = MemoryRemote::with_groups(vec![keep.clone(), stale]);

        let fresh = Group::new("Fresh", vec![Tab::new("https://c.dev", "c")]);
        remote
            .upload_groups(vec![keep.clone(), fresh.clone()], true)
            .await
            .unwrap();

        let ids: Vec<String> = remote.snapshot().await.into_iter().map(|g| g.id).collect();
        assert_eq!(ids, vec![keep.id, fresh.id]);
        assert_eq!(remote.stats().deleted, 1);
        assert_eq!(remote.stats().changed, 1);
    }

    #[tokio::test]
    async fn test_upsert_without_overwrite_keeps_remote_only_records() {
        let existing = Group::new("Existing", vec![Tab::new("https://a.dev", "a")]);
        let remote = MemoryRemote::with_groups(vec![existing]);

        remote
            .upload_groups(vec![Group::new("New", vec![])], false)
            .await
            .unwrap();

        assert_eq!(remote.snapshot().await.len(), 2);
        assert_eq!(remote.stats().deleted, 0);
    }

    #[tokio::test]
    async fn test_fail_next_counts_down() {
        let remote = MemoryRemote::new();
        remote.fail_next(2);

        assert!(remote.download_groups().await.is_err());
        assert!(remote.download_groups().await.is_err());
        assert!(remote.download_groups().await.is_ok());
    }

    #[tokio::test]
    async fn test_local_store_failure_toggle() {
        let store = MemoryLocalStore::new();
        store.set_failing(true);
        assert!(store.get_groups().await.is_err());

        store.set_failing(false);
        store.set_groups(vec![Group::new("A", vec![])]).await.unwrap();
        assert_eq!(store.get_groups().await.unwrap().len(), 1);
    }
}
