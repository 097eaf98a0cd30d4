use log::warn;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};
use crate::reminder::{Occurrence, Reminder};

const REMINDERS_FILE: &str = "reminders.json";
const HISTORY_FILE: &str = "history.json";

/// Offline cache: two JSON blob files overwritten wholesale on every
/// successful sync. Reads never fail the caller — a missing or
/// unparsable blob is served as empty, since the cache is only a
/// fallback for the authoritative remote record.
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    /// Open (creating if needed) a cache rooted at the platform's local
    /// data directory.
    pub fn new() -> EngineResult<Self> {
        let dir = dirs::data_local_dir()
            .ok_or_else(|| EngineError::storage("no local data dir available"))?
            .join("CareReminders");
        Self::at(dir)
    }

    /// Open a cache rooted at an explicit directory.
    pub fn at(dir: impl Into<PathBuf>) -> EngineResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| EngineError::storage(e.to_string()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load_reminders(&self) -> Vec<Reminder> {
        load_blob(&self.dir.join(REMINDERS_FILE))
    }

    pub fn save_reminders(&self, reminders: &[Reminder]) -> EngineResult<()> {
        save_blob(&self.dir.join(REMINDERS_FILE), reminders)
    }

    pub fn load_history(&self) -> Vec<Occurrence> {
        load_blob(&self.dir.join(HISTORY_FILE))
    }

    pub fn save_history(&self, history: &[Occurrence]) -> EngineResult<()> {
        save_blob(&self.dir.join(HISTORY_FILE), history)
    }
}

fn load_blob<T: serde::de::DeserializeOwned>(path: &Path) -> Vec<T> {
    if !path.exists() {
        return Vec::new();
    }
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("failed to read cache blob {:?}: {}", path, e);
            return Vec::new();
        }
    };
    match serde_json::from_str(&content) {
        Ok(data) => data,
        Err(e) => {
            warn!("discarding unparsable cache blob {:?}: {}", path, e);
            Vec::new()
        }
    }
}

fn save_blob<T: serde::Serialize>(path: &Path, data: &[T]) -> EngineResult<()> {
    let content =
        serde_json::to_string_pretty(data).map_err(|e| EngineError::storage(e.to_string()))?;
    fs::write(path, content).map_err(|e| EngineError::storage(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reminder::{Cadence, ReminderKind};
    use chrono::Utc;
    use std::env;

    fn scratch_cache(name: &str) -> CacheStore {
        let dir = env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        CacheStore::at(dir).unwrap()
    }

    fn sample_reminder(id: i64) -> Reminder {
        Reminder {
            id,
            kind: ReminderKind::Hydration,
            label: format!("Water {}", id),
            note: None,
            cadence: Cadence::Interval { every_minutes: 90 },
            enabled: true,
            missed_count: 0,
            created_at: Utc::now(),
            snoozed_until: None,
        }
    }

    #[test]
    fn test_load_from_empty_cache_returns_empty() {
        let cache = scratch_cache("care_reminders_test_empty_cache");
        assert!(cache.load_reminders().is_empty());
        assert!(cache.load_history().is_empty());
        let _ = fs::remove_dir_all(cache.dir());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let cache = scratch_cache("care_reminders_test_roundtrip");

        cache
            .save_reminders(&[sample_reminder(1), sample_reminder(2)])
            .unwrap();
        let loaded = cache.load_reminders();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].label, "Water 1");

        let _ = fs::remove_dir_all(cache.dir());
    }

    #[test]
    fn test_save_overwrites_wholesale() {
        let cache = scratch_cache("care_reminders_test_overwrite");

        cache
            .save_reminders(&[sample_reminder(1), sample_reminder(2)])
            .unwrap();
        cache.save_reminders(&[sample_reminder(3)]).unwrap();

        let loaded = cache.load_reminders();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, 3);

        let _ = fs::remove_dir_all(cache.dir());
    }

    #[test]
    fn test_unparsable_blob_reads_as_empty() {
        let cache = scratch_cache("care_reminders_test_garbage");
        fs::write(cache.dir().join("reminders.json"), "{not json").unwrap();
        assert!(cache.load_reminders().is_empty());
        let _ = fs::remove_dir_all(cache.dir());
    }
}
