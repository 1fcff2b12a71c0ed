//! Local key-value storage behind the replicated state machine
//!
//! The store is the only component that touches actual data. Callers go
//! through the [`KvStore`] trait; nothing outside a backend sees the map.

use crate::common::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Trait for key-value storage backends.
///
/// Every operation returns a `Result` so a persistent backend can report I/O
/// failures. The in-memory backend never fails.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;

    /// Owned copy of the full mapping. Later mutations do not affect it.
    fn snapshot(&self) -> Result<BTreeMap<String, String>>;

    /// Replace the whole mapping.
    fn restore(&self, state: BTreeMap<String, String>) -> Result<()>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// In-memory store (default)
pub struct MemStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A poisoned map is still a consistent map: every mutation is a
        // single insert/remove.
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    fn snapshot(&self) -> Result<BTreeMap<String, String>> {
        let map = self.lock();
        Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn restore(&self, state: BTreeMap<String, String>) -> Result<()> {
        let mut map = self.lock();
        *map = state.into_iter().collect();
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_key() {
        let store = MemStore::new();
        assert_eq!(store.get("nope").unwrap(), None);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_set_get_delete() {
        let store = MemStore::new();
        store.set("a", "1").unwrap();
        store.set("a", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));

        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);

        // Deleting an absent key is not an error
        store.delete("a").unwrap();
    }

    #[test]
    fn test_snapshot_does_not_alias_live_state() {
        let store = MemStore::new();
        store.set("k", "before").unwrap();

        let snap = store.snapshot().unwrap();
        store.set("k", "after").unwrap();
        store.set("other", "x").unwrap();

        assert_eq!(snap.get("k").map(String::as_str), Some("before"));
        assert!(!snap.contains_key("other"));
    }

    #[test]
    fn test_restore_replaces_everything() {
        let store = MemStore::new();
        store.set("stale", "1").unwrap();

        let mut state = BTreeMap::new();
        state.insert("fresh".to_string(), "2".to_string());
        store.restore(state).unwrap();

        assert_eq!(store.get("stale").unwrap(), None);
        assert_eq!(store.get("fresh").unwrap().as_deref(), Some("2"));
        assert_eq!(store.len().unwrap(), 1);
    }
}
