use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::Value;
use crate::error::StorageError;
use crate::lock::{HeldKeys, Lock};
use crate::storage::{Artifact, Backend};

type Values = Arc<RwLock<HashMap<String, Value>>>;

/// Storage kept in memory for as long as the backend (or a clone of it)
/// lives. Clones share their contents and their locks, so two graphs holding
/// clones of the same backend behave like two processes sharing a directory.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    values: Values,
    held: HeldKeys,
    cache_results: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            values: Values::default(),
            held: HeldKeys::default(),
            cache_results: true,
        }
    }

    /// Sets whether values going through this backend are also memoized.
    pub fn cache_results(mut self, cache: bool) -> Self {
        self.cache_results = cache;
        self
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn artifact(&self, name: &str) -> Box<dyn Artifact> {
        Box::new(MemoryArtifact {
            name: name.to_string(),
            values: self.values.clone(),
            held: self.held.clone(),
        })
    }

    fn caches_results(&self) -> bool {
        self.cache_results
    }
}

struct MemoryArtifact {
    name: String,
    values: Values,
    held: HeldKeys,
}

impl Artifact for MemoryArtifact {
    fn exists(&self) -> bool {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&self.name)
    }

    fn load(&self) -> Result<Value, StorageError> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(self.name.clone()))
    }

    fn save(&self, value: &Value) -> Result<(), StorageError> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.name.clone(), value.clone());
        Ok(())
    }

    fn delete(&self) -> Result<(), StorageError> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(self.name.clone()))
    }

    fn prepare(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn lock(&self) -> Lock {
        Lock::memory(self.held.clone(), self.name.clone())
    }
}
