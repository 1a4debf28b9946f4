//! The storage boundary of the engine.
//!
//! A [`Backend`] decides where and how node values are kept. For every node
//! it hands out an [`Artifact`], a handle addressing that node's stored value
//! by the node's name. The engine never looks inside what is stored: it only
//! asks whether something exists, loads it, saves it, and locks it.

mod file;
mod memory;
mod volatile;

use crate::Value;
use crate::error::StorageError;
use crate::lock::Lock;

pub use file::{Cbor, CborBackend, Codec, FileBackend, Json, JsonBackend};
pub use memory::MemoryBackend;
pub use volatile::VolatileBackend;

/// A family of artifacts sharing a storage location and format.
pub trait Backend: Send + Sync {
    /// Returns the handle for the artifact stored under `name`.
    fn artifact(&self, name: &str) -> Box<dyn Artifact>;

    /// Whether values handled by this backend should also be kept in the
    /// in-memory cache.
    fn caches_results(&self) -> bool {
        true
    }

    /// Whether anything saved through this backend can be loaded later.
    fn is_persistent(&self) -> bool {
        true
    }
}

/// The stored value of a single node.
pub trait Artifact: Send + Sync {
    fn exists(&self) -> bool;

    fn load(&self) -> Result<Value, StorageError>;

    fn save(&self, value: &Value) -> Result<(), StorageError>;

    /// Fails with [`StorageError::NotFound`] if there is nothing to delete.
    fn delete(&self) -> Result<(), StorageError>;

    /// Makes sure the artifact's location can receive a write.
    fn prepare(&self) -> Result<(), StorageError>;

    /// A lock guarding this artifact, not yet acquired.
    fn lock(&self) -> Lock;
}
