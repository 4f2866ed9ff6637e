//! Device-local, non-shared key-value storage.
//!
//! Only the reading timer writes here. Nothing stored in this module is
//! authoritative study data.

use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use anyhow::{Context, Result};
use log::warn;

pub trait LocalStore: Send + Sync {
    fn persist(&self, key: &str, value: &str) -> Result<()>;
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn clear(&self, key: &str) -> Result<()>;
}

type Entries = BTreeMap<String, String>;

fn read_guard(lock: &RwLock<Entries>) -> RwLockReadGuard<'_, Entries> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_guard(lock: &RwLock<Entries>) -> RwLockWriteGuard<'_, Entries> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Entries kept in one pretty-printed JSON object on disk.
pub struct FileLocalStore {
    path: PathBuf,
    data: RwLock<Entries>,
}

impl FileLocalStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read local state from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Discarding unreadable local state at {}: {err}", path.display());
                Entries::default()
            })
        } else {
            Entries::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    fn flush(&self, data: &Entries) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create local state directory {}", parent.display())
            })?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write local state to {}", self.path.display()))
    }
}

impl LocalStore for FileLocalStore {
    fn persist(&self, key: &str, value: &str) -> Result<()> {
        let mut guard = write_guard(&self.data);
        guard.insert(key.to_string(), value.to_string());
        self.flush(&guard)
    }

    fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(read_guard(&self.data).get(key).cloned())
    }

    fn clear(&self, key: &str) -> Result<()> {
        let mut guard = write_guard(&self.data);
        if guard.remove(key).is_some() {
            self.flush(&guard)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryLocalStore {
    data: RwLock<Entries>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        read_guard(&self.data).keys().cloned().collect()
    }
}

impl LocalStore for MemoryLocalStore {
    fn persist(&self, key: &str, value: &str) -> Result<()> {
        write_guard(&self.data).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(read_guard(&self.data).get(key).cloned())
    }

    fn clear(&self, key: &str) -> Result<()> {
        write_guard(&self.data).remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("local.json");

        let store = FileLocalStore::new(path.clone()).unwrap();
        store.persist("timer_a", "{\"x\":1}").unwrap();
        store.persist("timer_b", "2").unwrap();
        store.clear("timer_b").unwrap();
        drop(store);

        let reopened = FileLocalStore::new(path).unwrap();
        assert_eq!(reopened.load("timer_a").unwrap().as_deref(), Some("{\"x\":1}"));
        assert_eq!(reopened.load("timer_b").unwrap(), None);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.json");
        fs::write(&path, "not json").unwrap();
        let store = FileLocalStore::new(path).unwrap();
        assert_eq!(store.load("anything").unwrap(), None);
    }
}
