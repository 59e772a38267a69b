//! In-memory key-value store.
//!
//! Clones share the same underlying map, so dropping every component that
//! uses one clone and reopening against another simulates a process
//! restart with the storage intact.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::KeyValueStore;
use crate::error::KvError;

#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    writes: Arc<AtomicU64>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every subsequent `set`/`delete` fail (simulates a full or
    /// unavailable disk).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `set`/`delete` calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn check_writable(&self, key: &str) -> Result<(), KvError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable(format!("write to '{key}' refused")));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.check_writable(key)?;
        self.entries().insert(key.to_string(), value.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        self.check_writable(key)?;
        self.entries().remove(key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let store = MemoryKvStore::new();
        assert!(store.is_empty());

        store.set("a", b"one").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"one".to_vec()));

        store.set("a", b"two").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"two".to_vec()));

        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        store.delete("missing").unwrap();
        assert_eq!(store.write_count(), 4);
    }

    #[test]
    fn test_clones_share_storage() {
        let store = MemoryKvStore::new();
        let reopened = store.clone();
        store.set("queue", b"[]").unwrap();
        assert_eq!(reopened.get("queue").unwrap(), Some(b"[]".to_vec()));
        assert_eq!(reopened.keys(), vec!["queue".to_string()]);
    }

    #[test]
    fn test_failed_writes_leave_state_untouched() {
        let store = MemoryKvStore::new();
        store.set("k", b"v").unwrap();
        store.fail_writes(true);

        assert!(matches!(store.set("k", b"x"), Err(KvError::Unavailable(_))));
        assert!(store.delete("k").is_err());
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));

        store.fail_writes(false);
        store.set("k", b"x").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"x".to_vec()));
    }
}
