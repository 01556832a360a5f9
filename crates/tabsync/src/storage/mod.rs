//! Collaborator interfaces and storage backends
//!
//! The sync core only talks to the outside world through these traits:
//! local persistence, the remote backend, authentication state, and the slot
//! where the device identifier is persisted.

use crate::model::Group;
use anyhow::Result;
use async_trait::async_trait;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "filesystem")]
pub mod filesystem;

/// Local persistent store for tab groups
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Read every group in display order
    async fn get_groups(&self) -> Result<Vec<Group>>;

    /// Replace the full set of groups
    async fn set_groups(&self, groups: Vec<Group>) -> Result<()>;

    /// Get storage backend name
    fn name(&self) -> &'static str;
}

/// Remote backend shared by all devices
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn download_groups(&self) -> Result<Vec<Group>>;

    /// Upload groups. With `overwrite`, the remote set is made to exactly
    /// mirror `groups`: records absent from it are deleted remotely.
    async fn upload_groups(&self, groups: Vec<Group>, overwrite: bool) -> Result<()>;
}

/// Session state
pub trait AuthProvider: Send + Sync {
    fn is_authenticated(&self) -> bool;
}

/// Persisted device identifier with a redundant backup slot
#[async_trait]
pub trait DeviceIdentityStore: Send + Sync {
    async fn get_primary(&self) -> Result<Option<String>>;

    async fn set_primary(&self, device_id: &str) -> Result<()>;

    async fn get_backup(&self) -> Result<Option<String>>;

    async fn set_backup(&self, device_id: &str) -> Result<()>;
}
