//! Group sort order, persisted as a small JSON document at
//! `group_sort_order.json` next to the working directory.
//!
//! Written atomically (tmp sibling, then rename) so a crash mid-write
//! never leaves a corrupt file. Node-local by design: only the master
//! accepts admin writes.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SortEntry {
    pub id: i64,
    pub sort: i32,
}

pub fn save_sort_order(path: &Path, entries: &[SortEntry]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(entries)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    tracing::debug!(path = %path.display(), entries = entries.len(), "Sort order saved");
    Ok(())
}

/// Missing or malformed file reads as empty (first run).
pub fn load_sort_order(path: &Path) -> Vec<SortEntry> {
    let Ok(data) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    match serde_json::from_str(&data) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "Sort order file malformed, ignoring");
            Vec::new()
        }
    }
}
