use std::fs;
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};

use crate::Value;
use crate::error::StorageError;
use crate::lock::Lock;
use crate::storage::{Artifact, Backend};

/// Translates values to and from the bytes of a file.
pub trait Codec: Clone + Send + Sync + 'static {
    /// File extension, without the leading dot.
    fn extension(&self) -> &str;

    fn encode(&self, value: &Value) -> Result<Vec<u8>, StorageError>;

    fn decode(&self, bytes: &[u8]) -> Result<Value, StorageError>;
}

/// Structured text. Object keys are written in sorted order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json {
    pretty: bool,
}

impl Json {
    /// Indented output, easier on the eyes when inspecting artifacts by hand.
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl Codec for Json {
    fn extension(&self) -> &str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, StorageError> {
        let bytes = match self.pretty {
            true => serde_json::to_vec_pretty(value)?,
            false => serde_json::to_vec(value)?,
        };
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, StorageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact binary objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cbor;

impl Codec for Cbor {
    fn extension(&self) -> &str {
        "cbor"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, StorageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(value, &mut bytes)?;
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, StorageError> {
        Ok(ciborium::from_reader(bytes)?)
    }
}

/// Stores every node as one file, `<dir>/<name>.<ext>`. Node names containing
/// `/` end up in subdirectories of `dir`.
#[derive(Debug, Clone)]
pub struct FileBackend<C: Codec> {
    dir: Utf8PathBuf,
    codec: C,
    cache_results: bool,
}

pub type JsonBackend = FileBackend<Json>;
pub type CborBackend = FileBackend<Cbor>;

impl<C: Codec> FileBackend<C> {
    /// Creates the backend, creating `dir` if it doesn't exist yet.
    pub fn new(dir: impl Into<Utf8PathBuf>, codec: C) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            codec,
            cache_results: true,
        })
    }

    /// Sets whether values going through this backend are also memoized.
    pub fn cache_results(mut self, cache: bool) -> Self {
        self.cache_results = cache;
        self
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Location of the artifact stored under `name`. Node names are checked
    /// to be relative paths without `.` or `..` components when the node is
    /// built, so the result always lies inside [`FileBackend::dir`].
    pub fn path(&self, name: &str) -> Utf8PathBuf {
        self.dir.join(format!("{name}.{}", self.codec.extension()))
    }
}

impl FileBackend<Json> {
    pub fn json(dir: impl Into<Utf8PathBuf>) -> Result<Self, StorageError> {
        Self::new(dir, Json::default())
    }
}

impl FileBackend<Cbor> {
    pub fn cbor(dir: impl Into<Utf8PathBuf>) -> Result<Self, StorageError> {
        Self::new(dir, Cbor)
    }
}

impl<C: Codec> Backend for FileBackend<C> {
    fn artifact(&self, name: &str) -> Box<dyn Artifact> {
        Box::new(FileArtifact {
            path: self.path(name),
            codec: self.codec.clone(),
        })
    }

    fn caches_results(&self) -> bool {
        self.cache_results
    }
}

struct FileArtifact<C: Codec> {
    path: Utf8PathBuf,
    codec: C,
}

impl<C: Codec> Artifact for FileArtifact<C> {
    fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn load(&self) -> Result<Value, StorageError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(self.path.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        self.codec.decode(&bytes)
    }

    fn save(&self, value: &Value) -> Result<(), StorageError> {
        self.prepare()?;

        let bytes = self.codec.encode(value)?;

        // Written aside first, so a crash never leaves a truncated artifact
        // that `exists` would report.
        let temp = Utf8PathBuf::from(format!("{}.{}.tmp", self.path, std::process::id()));
        fs::write(&temp, bytes)?;

        if let Err(err) = fs::rename(&temp, &self.path) {
            let _ = fs::remove_file(&temp);
            return Err(err.into());
        }

        Ok(())
    }

    fn delete(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(self.path.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn prepare(&self) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    fn lock(&self) -> Lock {
        Lock::file(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_json_artifact() {
        let (_dir, root) = scratch();
        let backend = JsonBackend::json(&root).unwrap();
        let artifact = backend.artifact("load");

        assert!(!artifact.exists());
        artifact.save(&json!([[1, 2, 3], [4, 5, 6]])).unwrap();

        assert!(artifact.exists());
        assert!(root.join("load.json").is_file());
        assert_eq!(artifact.load().unwrap(), json!([[1, 2, 3], [4, 5, 6]]));
    }

    #[test]
    fn test_cbor_artifact() {
        let (_dir, root) = scratch();
        let backend = CborBackend::cbor(&root).unwrap();
        let value = json!({"name": "model", "weights": [0.5, -1.25], "ok": true});

        backend.artifact("model").save(&value).unwrap();

        assert!(root.join("model.cbor").is_file());
        assert_eq!(backend.artifact("model").load().unwrap(), value);
    }

    #[test]
    fn test_nested_names_create_directories() {
        let (_dir, root) = scratch();
        let backend = JsonBackend::json(&root).unwrap();
        let artifact = backend.artifact("stage/one/out");

        artifact.save(&json!(1)).unwrap();

        assert!(root.join("stage/one/out.json").is_file());
    }

    #[test]
    fn test_missing_and_corrupt() {
        let (_dir, root) = scratch();
        let backend = JsonBackend::json(&root).unwrap();
        let artifact = backend.artifact("broken");

        assert!(matches!(artifact.load(), Err(StorageError::NotFound(_))));
        assert!(matches!(artifact.delete(), Err(StorageError::NotFound(_))));

        fs::write(root.join("broken.json"), "{not json").unwrap();
        assert!(matches!(artifact.load(), Err(StorageError::Json(_))));

        artifact.delete().unwrap();
        assert!(!artifact.exists());
    }

    #[test]
    fn test_lock_sits_next_to_artifact() {
        let (_dir, root) = scratch();
        let backend = JsonBackend::json(&root).unwrap();
        let lock = backend.artifact("a").lock();

        assert_eq!(lock.marker().unwrap(), root.join("a.json.lock"));
    }

    #[test]
    fn test_pretty_json() {
        let bytes = Json::pretty().encode(&json!({"b": 1, "a": 2})).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.contains('\n'));
        assert!(text.find("\"a\"").unwrap() < text.find("\"b\"").unwrap());
    }
}
