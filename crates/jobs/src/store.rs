//! Record storage seam.
//!
//! Services keep their state behind [`RecordStore`] so a persistent backend
//! can replace the in-memory map without touching service logic.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use riskwatch_core::EngineError;

/// Keyed record storage.
pub trait RecordStore<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Result<Option<V>, StoreError>;

    /// Insert or replace; returns the previous value.
    fn upsert(&self, key: K, value: V) -> Result<Option<V>, StoreError>;

    /// Insert only if the key is free.
    fn insert_new(&self, key: K, value: V) -> Result<(), StoreError>;

    fn delete(&self, key: &K) -> Result<Option<V>, StoreError>;

    /// All values matching `predicate`, in unspecified order.
    fn query(&self, predicate: &dyn Fn(&V) -> bool) -> Result<Vec<V>, StoreError>;

    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

/// Store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store lock poisoned")]
    Poisoned,
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::storage(err.to_string())
    }
}

/// In-memory store for tests/dev and the default engine wiring.
#[derive(Debug)]
pub struct InMemoryStore<K, V> {
    records: RwLock<HashMap<K, V>>,
}

impl<K, V> InMemoryStore<K, V> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl<K, V> Default for InMemoryStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> RecordStore<K, V> for InMemoryStore<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(key).cloned())
    }

    fn upsert(&self, key: K, value: V) -> Result<Option<V>, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        Ok(records.insert(key, value))
    }

    fn insert_new(&self, key: K, value: V) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("{key:?}")));
        }
        records.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &K) -> Result<Option<V>, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        Ok(records.remove(key))
    }

    fn query(&self, predicate: &dyn Fn(&V) -> bool) -> Result<Vec<V>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.values().filter(|v| predicate(v)).cloned().collect())
    }

    fn len(&self) -> Result<usize, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.len())
    }
}
