//! Filesystem backends
//!
//! Groups are stored as one JSON document; writes go to a temp file that is
//! renamed over the target so a crash never leaves a half-written file.
//! The device identity keeps a primary and a backup file side by side.

use crate::model::Group;
use crate::storage::{DeviceIdentityStore, LocalStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

const GROUPS_FILE: &str = "groups.json";
const DEVICE_ID_FILE: &str = "device_id";
const DEVICE_ID_BACKUP_FILE: &str = "device_id.bak";

/// Local store backed by `<dir>/groups.json`
#[derive(Clone)]
pub struct FileLocalStore {
    path: PathBuf,
}

impl FileLocalStore {
    /// Create the store, creating `dir` if it doesn't exist
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;

        Ok(Self {
            path: dir.join(GROUPS_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LocalStore for FileLocalStore {
    async fn get_groups(&self) -> Result<Vec<Group>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.path.display()));
            }
        };

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    async fn set_groups(&self, groups: Vec<Group>) -> Result<()> {
        let json = serde_json::to_vec_pretty(&groups).context("Failed to serialize groups")?;
        write_atomic(&self.path, &json).await
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}

/// Device identity persisted as two plain files
#[derive(Clone)]
pub struct FileIdentityStore {
    primary: PathBuf,
    backup: PathBuf,
}

impl FileIdentityStore {
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create identity directory {}", dir.display()))?;

        Ok(Self {
            primary: dir.join(DEVICE_ID_FILE),
            backup: dir.join(DEVICE_ID_BACKUP_FILE),
        })
    }
}

async fn read_slot(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => {
            let trimmed = content.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl DeviceIdentityStore for FileIdentityStore {
    async fn get_primary(&self) -> Result<Option<String>> {
        read_slot(&self.primary).await
    }

    async fn set_primary(&self, device_id: &str) -> Result<()> {
        write_atomic(&self.primary, device_id.as_bytes()).await
    }

    async fn get_backup(&self) -> Result<Option<String>> {
        read_slot(&self.backup).await
    }

    async fn set_backup(&self, device_id: &str) -> Result<()> {
        write_atomic(&self.backup, device_id.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tab;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_groups_roundtrip_through_disk() {
        let temp_dir = TempDir::new().unwrap();
        let group = Group::new("Research", vec![Tab::new("https://docs.rs", "docs")]);

        {
            let store = FileLocalStore::new(temp_dir.path()).await.unwrap();
            store.set_groups(vec![group.clone()]).await.unwrap();
        }

        // Simulate a restart
        let store = FileLocalStore::new(temp_dir.path()).await.unwrap();
        assert_eq!(store.get_groups().await.unwrap(), vec![group]);
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileLocalStore::new(temp_dir.path().join("nested")).await.unwrap();
        assert!(store.get_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileLocalStore::new(temp_dir.path()).await.unwrap();
        std::fs::write(store.path(), "{not json").unwrap();

        let err = store.get_groups().await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse"));
    }

    #[tokio::test]
    async fn test_unreadable_file_is_an_error_not_empty() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("data");
        let store = FileLocalStore::new(&data_dir).await.unwrap();

        // data dir replaced by a plain file: the read fails with ENOTDIR
        std::fs::remove_dir(&data_dir).unwrap();
        std::fs::write(&data_dir, "not a directory").unwrap();

        let err = store.get_groups().await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read"));
    }

    #[tokio::test]
    async fn test_identity_slots_are_independent() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileIdentityStore::new(temp_dir.path()).await.unwrap();

        assert_eq!(store.get_primary().await.unwrap(), None);

        store.set_backup("linux_1700000000000_abc").await.unwrap();
        assert_eq!(store.get_primary().await.unwrap(), None);
        assert_eq!(
            store.get_backup().await.unwrap().as_deref(),
            Some("linux_1700000000000_abc")
        );
    }
}
