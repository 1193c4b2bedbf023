use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};

use crate::error::{ProctorError, Result};

const WARNINGS_FILE: &str = "warnings.json";

pub fn warning_key(exam_id: &str) -> String {
    format!("warn:{}", exam_id)
}

/// Persists warning levels across process restarts and reconnections.
pub trait WarningStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<u32>>;
    fn save(&self, key: &str, level: u32) -> Result<()>;
    fn clear(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryWarningStore {
    values: SyncMutex<HashMap<String, u32>>,
}

impl MemoryWarningStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WarningStore for MemoryWarningStore {
    fn load(&self, key: &str) -> Result<Option<u32>> {
        let values = self
            .values
            .lock()
            .map_err(|_| ProctorError::WarningStore("store lock poisoned".into()))?;
        Ok(values.get(key).copied())
    }

    fn save(&self, key: &str, level: u32) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| ProctorError::WarningStore("store lock poisoned".into()))?
            .insert(key.to_string(), level);
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| ProctorError::WarningStore("store lock poisoned".into()))?
            .remove(key);
        Ok(())
    }
}

/// JSON map of key to level in `<state dir>/warnings.json`.
pub struct FileWarningStore {
    path: PathBuf,
    write_lock: SyncMutex<()>,
}

impl FileWarningStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = state_dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            ProctorError::WarningStore(format!("Failed to create state directory {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            path: dir.join(WARNINGS_FILE),
            write_lock: SyncMutex::new(()),
        })
    }

    fn read_all(&self) -> Result<HashMap<String, u32>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(HashMap::new()),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                ProctorError::WarningStore(format!("Corrupt warning file {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(ProctorError::WarningStore(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn write_all(&self, values: &HashMap<String, u32>) -> Result<()> {
        let raw = serde_json::to_string_pretty(values)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| ProctorError::WarningStore(format!("Failed to write {}: {}", self.path.display(), e)))
    }

    fn update(&self, apply: impl FnOnce(&mut HashMap<String, u32>)) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| ProctorError::WarningStore("store lock poisoned".into()))?;
        let mut values = self.read_all()?;
        apply(&mut values);
        self.write_all(&values)
    }
}

impl WarningStore for FileWarningStore {
    fn load(&self, key: &str) -> Result<Option<u32>> {
        Ok(self.read_all()?.get(key).copied())
    }

    fn save(&self, key: &str, level: u32) -> Result<()> {
        self.update(|values| {
            values.insert(key.to_string(), level);
        })
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.update(|values| {
            values.remove(key);
        })
    }
}

/// Cumulative count of out-of-compliance ticks for one exam.
///
/// Only the proctoring session writes it. Everything else, the room
/// coordinator included, observes it through a [`WarningReader`].
pub struct WarningCounter {
    key: String,
    level: Arc<AtomicU32>,
    store: Arc<dyn WarningStore>,
}

#[derive(Debug, Clone)]
pub struct WarningReader {
    level: Arc<AtomicU32>,
}

impl WarningReader {
    pub fn get(&self) -> u32 {
        self.level.load(Ordering::SeqCst)
    }
}

impl WarningCounter {
    /// Opens the counter for `exam_id`, picking up any persisted level.
    pub fn open(store: Arc<dyn WarningStore>, exam_id: &str) -> Result<Self> {
        let key = warning_key(exam_id);
        let level = store.load(&key)?.unwrap_or(0);
        if level > 0 {
            tracing::info!(exam_id = %exam_id, level, "Restored warning level");
        }
        Ok(Self {
            key,
            level: Arc::new(AtomicU32::new(level)),
            store,
        })
    }

    pub fn level(&self) -> u32 {
        self.level.load(Ordering::SeqCst)
    }

    pub fn reader(&self) -> WarningReader {
        WarningReader {
            level: self.level.clone(),
        }
    }

    /// Bumps the level and persists it. The in-memory level moves forward
    /// even if persisting fails.
    pub(crate) fn increment(&self) -> Result<u32> {
        let level = self.level.fetch_add(1, Ordering::SeqCst) + 1;
        self.store.save(&self.key, level)?;
        Ok(level)
    }

    /// Session start only.
    pub(crate) fn reset(&self) -> Result<()> {
        self.level.store(0, Ordering::SeqCst);
        self.store.clear(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn temp_dir() -> PathBuf {
        let suffix: u64 = rand::thread_rng().gen();
        std::env::temp_dir().join(format!("proctor-warnings-{:x}", suffix))
    }

    #[test]
    fn test_counter_restores_and_persists() {
        let store: Arc<dyn WarningStore> = Arc::new(MemoryWarningStore::new());
        store.save("warn:exam-1", 4).unwrap();

        let counter = WarningCounter::open(store.clone(), "exam-1").unwrap();
        let reader = counter.reader();
        assert_eq!(reader.get(), 4);

        assert_eq!(counter.increment().unwrap(), 5);
        assert_eq!(reader.get(), 5);
        assert_eq!(store.load("warn:exam-1").unwrap(), Some(5));
    }

    #[test]
    fn test_reset_clears_key() {
        let store: Arc<dyn WarningStore> = Arc::new(MemoryWarningStore::new());
        let counter = WarningCounter::open(store.clone(), "exam-2").unwrap();
        counter.increment().unwrap();
        counter.reset().unwrap();

        assert_eq!(counter.level(), 0);
        assert_eq!(store.load("warn:exam-2").unwrap(), None);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = temp_dir();
        {
            let store = FileWarningStore::new(&dir).unwrap();
            store.save("warn:a", 2).unwrap();
            store.save("warn:b", 7).unwrap();
            store.clear("warn:a").unwrap();
        }

        let store = FileWarningStore::new(&dir).unwrap();
        assert_eq!(store.load("warn:a").unwrap(), None);
        assert_eq!(store.load("warn:b").unwrap(), Some(7));
        assert_eq!(store.load("warn:missing").unwrap(), None);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = temp_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(WARNINGS_FILE), "{not json").unwrap();

        let store = FileWarningStore::new(&dir).unwrap();
        assert!(matches!(store.load("warn:x"), Err(ProctorError::WarningStore(_))));

        let _ = fs::remove_dir_all(dir);
    }
}
