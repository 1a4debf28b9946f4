use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::Value;

/// In-memory memoization of node values, keyed by node name.
///
/// An entry, once inserted, is treated as authoritative for as long as the
/// cache lives: it is never invalidated and never checked against storage
/// again. A value written to storage by another process after it was cached
/// here will not be observed. The cache has no capacity bound and grows with
/// every distinct node evaluated through it.
///
/// A [`Graph`](crate::Graph) creates its own cache; several graphs can share
/// one by passing it to [`Graph::with_cache`](crate::Graph::with_cache).
#[derive(Debug, Default)]
pub struct Cache {
    values: RwLock<HashMap<String, Value>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub(crate) fn insert(&self, name: impl Into<String>, value: Value) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value);
    }

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
