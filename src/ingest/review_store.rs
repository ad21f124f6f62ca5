//! Persistent record of which duplicate groups an operator has already
//! reviewed, stored as a single pretty-printed JSON file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewEntry {
    pub reviewed: bool,
    pub timestamp: String,
}

/// Guards the on-disk file with a process-wide mutex; every mutation
/// rewrites the whole file rather than patching it in place.
pub struct DuplicateReviewStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DuplicateReviewStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Default location relative to the process's working directory.
    #[must_use]
    pub fn default_path() -> PathBuf {
        Path::new("data").join("duplicate-review.json")
    }

    /// Loads the current mapping. A missing or unreadable file is treated
    /// as an empty mapping rather than an error.
    #[must_use]
    pub fn load(&self) -> BTreeMap<String, ReviewEntry> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(path = %self.path.display(), error = %err, "duplicate review store is corrupt, treating as empty");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        }
    }

    /// Marks `group_id` as reviewed or not, rewriting the whole store.
    /// Marking a group reviewed inserts an entry with the current
    /// timestamp; marking it unreviewed removes the key entirely rather
    /// than recording `reviewed: false`, matching the original store's
    /// behavior of treating absence as the unreviewed state. A write
    /// failure is logged and swallowed; it never propagates to the caller
    /// since the review flag is advisory metadata.
    pub fn set_reviewed(&self, group_id: &str, reviewed: bool) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = match std::fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str::<BTreeMap<String, ReviewEntry>>(&contents)
                .unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        };

        if reviewed {
            map.insert(
                group_id.to_string(),
                ReviewEntry {
                    reviewed: true,
                    timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                },
            );
        } else {
            map.remove(group_id);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(err) = std::fs::create_dir_all(parent) {
                    error!(path = %parent.display(), error = %err, "failed creating duplicate review store directory");
                    return;
                }
            }
        }

        match serde_json::to_string_pretty(&map) {
            Ok(serialized) => {
                if let Err(err) = std::fs::write(&self.path, serialized) {
                    error!(path = %self.path.display(), error = %err, "failed writing duplicate review store");
                }
            }
            Err(err) => {
                error!(error = %err, "failed serializing duplicate review store");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_reviewed_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = DuplicateReviewStore::new(dir.path().join("review.json"));

        assert!(store.load().is_empty());
        store.set_reviewed("stem:foo", true);

        let loaded = store.load();
        assert!(loaded.get("stem:foo").unwrap().reviewed);
    }

    #[test]
    fn marking_unreviewed_removes_the_entry_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let store = DuplicateReviewStore::new(dir.path().join("review.json"));

        store.set_reviewed("stem:foo", true);
        assert!(store.load().contains_key("stem:foo"));

        store.set_reviewed("stem:foo", false);
        assert!(!store.load().contains_key("stem:foo"));
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DuplicateReviewStore::new(dir.path().join("nonexistent.json"));
        assert!(store.load().is_empty());
    }
}
