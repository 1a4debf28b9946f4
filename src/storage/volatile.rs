use crate::Value;
use crate::error::StorageError;
use crate::lock::{HeldKeys, Lock};
use crate::storage::{Artifact, Backend};

/// Storage that keeps nothing. Nodes bound to it never exist, are recomputed
/// in every process, and only benefit from the in-memory cache.
///
/// Computations are still locked in-process by node name, so two threads
/// evaluating the same node don't both run its function: the second one gets
/// [`LockError::Held`](crate::LockError::Held) until the first is done.
#[derive(Debug, Clone, Default)]
pub struct VolatileBackend {
    held: HeldKeys,
}

impl VolatileBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for VolatileBackend {
    fn artifact(&self, name: &str) -> Box<dyn Artifact> {
        Box::new(VolatileArtifact {
            name: name.to_string(),
            held: self.held.clone(),
        })
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

struct VolatileArtifact {
    name: String,
    held: HeldKeys,
}

impl Artifact for VolatileArtifact {
    fn exists(&self) -> bool {
        false
    }

    fn load(&self) -> Result<Value, StorageError> {
        Err(StorageError::Unsupported("volatile storage keeps no values"))
    }

    fn save(&self, _: &Value) -> Result<(), StorageError> {
        Ok(())
    }

    fn delete(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn prepare(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn lock(&self) -> Lock {
        Lock::memory(self.held.clone(), self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LockError;

    #[test]
    fn test_nothing_is_kept() {
        let backend = VolatileBackend::new();
        let artifact = backend.artifact("a");

        artifact.save(&Value::from(1)).unwrap();

        assert!(!artifact.exists());
        assert!(matches!(artifact.load(), Err(StorageError::Unsupported(_))));
        assert!(!backend.is_persistent());
    }

    #[test]
    fn test_same_name_contends() {
        let backend = VolatileBackend::new();

        let _guard = backend.artifact("a").lock().scoped().unwrap();

        let mut same = backend.clone().artifact("a").lock();
        assert!(matches!(same.acquire(), Err(LockError::Held(_))));

        let mut other = backend.artifact("b").lock();
        other.acquire().unwrap();
    }
}
