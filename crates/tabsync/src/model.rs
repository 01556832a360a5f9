// File: tabsync/src/model.rs
// Purpose: Tab and group records with version metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A saved browser tab. Owned by exactly one [`Group`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "favicon_url", skip_serializing_if = "Option::is_none")]
    pub favicon_url: Option<String>,
    #[serde(alias = "created_at")]
    pub created_at: DateTime<Utc>,
}

impl Tab {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            title: title.into(),
            favicon_url: None,
            created_at: Utc::now(),
        }
    }

    /// Identity key for duplicate detection
    pub fn url_key(&self) -> String {
        normalize_url(&self.url)
    }
}

/// A named, ordered collection of tabs. The unit of sync and locking.
///
/// `version == 0` and `updated_at == None` mean the record was never stamped;
/// [`Group::stamp_if_missing`] fills them in at push time without bumping an
/// existing version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tabs: Vec<Tab>,
    #[serde(default, alias = "is_locked")]
    pub is_locked: bool,
    #[serde(default)]
    pub version: u64,
    #[serde(default, alias = "updated_at", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "device_id", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl Group {
    pub fn new(name: impl Into<String>, tabs: Vec<Tab>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            tabs,
            is_locked: false,
            version: 1,
            updated_at: Some(Utc::now()),
            device_id: None,
        }
    }

    /// Last write time; unstamped records sort before everything else
    pub fn updated_time(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or_default()
    }

    /// Record a committed mutation: version + 1, fresh timestamp, origin device.
    pub fn touch(&mut self, device_id: Option<&str>) {
        self.version = self.version.max(1) + 1;
        let now = Utc::now();
        // keep UpdatedAt monotonic on this device even if the wall clock steps back
        self.updated_at = Some(match self.updated_at {
            Some(prev) if prev >= now => prev + chrono::Duration::milliseconds(1),
            _ => now,
        });
        if let Some(device_id) = device_id {
            self.device_id = Some(device_id.to_string());
        }
    }

    /// Fill in missing version/timestamp. Never increments an existing version.
    pub fn stamp_if_missing(&mut self) -> bool {
        let mut stamped = false;
        if self.version == 0 {
            self.version = 1;
            stamped = true;
        }
        if self.updated_at.is_none() {
            self.updated_at = Some(Utc::now());
            stamped = true;
        }
        stamped
    }

    /// Empty groups are garbage unless the user locked them
    pub fn is_garbage(&self) -> bool {
        self.tabs.is_empty() && !self.is_locked
    }

    /// Normalized URL set, used for tab-set equality
    pub fn url_set(&self) -> HashSet<String> {
        self.tabs.iter().map(Tab::url_key).collect()
    }

    pub fn same_tab_set(&self, other: &Group) -> bool {
        self.tabs.len() == other.tabs.len() && self.url_set() == other.url_set()
    }
}

/// Drop groups that are empty and unlocked.
pub fn collect_garbage(groups: Vec<Group>) -> Vec<Group> {
    groups.into_iter().filter(|g| !g.is_garbage()).collect()
}

pub fn total_tabs(groups: &[Group]) -> usize {
    groups.iter().map(|g| g.tabs.len()).sum()
}

/// Canonical form of a tab URL for duplicate detection.
///
/// Scheme and host are lowercased and the fragment is dropped. A trailing slash
/// is removed unless a query follows it. Strings that don't parse as URLs are
/// trimmed and lowercased.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match url::Url::parse(trimmed) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            let mut out = parsed.to_string();
            if parsed.query().is_none() && out.ends_with('/') {
                out.pop();
            }
            out
        }
        Err(_) => trimmed.trim_end_matches('/').to_lowercase(),
    }
}
