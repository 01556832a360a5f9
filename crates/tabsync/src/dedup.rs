// File: tabsync/src/dedup.rs
// Purpose: Duplicate tab detection across all groups

use anyhow::Result;
use std::collections::{HashMap, HashSet};

use crate::model::{collect_garbage, Group};

/// Result of a duplicate sweep
#[derive(Debug, Clone, PartialEq)]
pub struct DedupReport {
    pub groups: Vec<Group>,
    pub removed_count: usize,
    /// Groups that lost at least one tab (including ones then garbage-collected)
    pub changed_group_ids: Vec<String>,
}

/// Remove duplicate tabs, where identity is the normalized URL.
///
/// Within each duplicate set the tab with the newest `created_at` survives;
/// on a tie the first occurrence in display order wins. Every group that
/// loses a tab gets one version bump. Groups left empty are dropped unless
/// locked. Fails if two groups share an id, since the sweep would then be
/// ambiguous.
pub fn remove_duplicates(groups: Vec<Group>, device_id: Option<&str>) -> Result<DedupReport> {
    let mut seen_ids = HashSet::new();
    for group in &groups {
        if !seen_ids.insert(group.id.as_str()) {
            anyhow::bail!("duplicate group id {} in local state", group.id);
        }
    }

    // url key -> (group index, tab index) of the current winner
    let mut winners: HashMap<String, (usize, usize)> = HashMap::new();
    for (gi, group) in groups.iter().enumerate() {
        for (ti, tab) in group.tabs.iter().enumerate() {
            let key = tab.url_key();
            match winners.get(&key) {
                Some(&(wg, wt)) if groups[wg].tabs[wt].created_at >= tab.created_at => {}
                _ => {
                    winners.insert(key, (gi, ti));
                }
            }
        }
    }

    let keep: HashSet<(usize, usize)> = winners.into_values().collect();
    let mut removed_count = 0;
    let mut changed_group_ids = Vec::new();

    let mut swept = Vec::with_capacity(groups.len());
    for (gi, mut group) in groups.into_iter().enumerate() {
        let before = group.tabs.len();
        let mut ti = 0;
        group.tabs.retain(|_| {
            let survives = keep.contains(&(gi, ti));
            ti += 1;
            survives
        });

        let removed = before - group.tabs.len();
        if removed > 0 {
            removed_count += removed;
            changed_group_ids.push(group.id.clone());
            group.touch(device_id);
        }
        swept.push(group);
    }

    Ok(DedupReport {
        groups: collect_garbage(swept),
        removed_count,
        changed_group_ids,
    })
}
