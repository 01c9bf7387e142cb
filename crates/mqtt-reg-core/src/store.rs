//! Durable key-value store contract used by persistent registers.
//!
//! Keys and values are raw byte strings. Implementations must make a value
//! durable once `flush` returns.

use crate::error::StoreError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Byte-oriented key-value store with an explicit durability barrier.
pub trait KvStore: Send + Sync {
    /// Check whether `key` has a stored value.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be queried.
    fn contains(&self, key: &[u8]) -> Result<bool, StoreError>;

    /// Read the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be queried.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Assign `value` to `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Make all previous writes durable.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot sync.
    fn flush(&self) -> Result<(), StoreError>;
}

/// In-memory store. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.contains_key(key))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_basic_operations() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        assert!(!store.contains(b"lamp").unwrap());

        store.set(b"lamp", b"\x01").unwrap();
        assert!(store.contains(b"lamp").unwrap());
        assert_eq!(store.get(b"lamp").unwrap(), Some(vec![1]));

        store.set(b"lamp", b"\x00").unwrap();
        assert_eq!(store.get(b"lamp").unwrap(), Some(vec![0]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn memory_store_clones_share_contents() {
        let store = MemoryStore::new();
        let other = store.clone();

        store.set(b"k", b"v").unwrap();
        assert_eq!(other.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
