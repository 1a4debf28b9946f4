use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while configuring a [`Graph`](crate::Graph): registering
/// backends or constructing nodes. These always indicate caller misuse.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("A node named '{0}' already exists in this graph")]
    DuplicateNodeName(String),

    #[error("The backend '{0}' has already been added")]
    DuplicateBackend(String),

    #[error("The backend '{0}' is not registered, available: [{1}]")]
    UnknownBackend(String, String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Errors raised by an artifact [`Lock`](crate::Lock).
#[derive(Debug, Error)]
pub enum LockError {
    #[error("The lock {0} is currently held")]
    Held(Utf8PathBuf),

    #[error("Couldn't create lock {0}, the parent location is missing")]
    Unavailable(Utf8PathBuf),

    #[error("Lock {0}:\n{1}")]
    Io(Utf8PathBuf, std::io::Error),
}

/// Errors raised at the storage boundary by an [`Artifact`](crate::storage::Artifact).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Artifact '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't process JSON.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Couldn't encode CBOR.\n{0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode CBOR.\n{0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
}

/// Errors raised while evaluating a node. Every variant carries the name of
/// the node whose evaluation failed; failures in dependencies are propagated
/// as-is, so the name points at the node that actually broke.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Node '{node}': {source}")]
    Lock { node: String, source: LockError },

    #[error("Node '{node}': couldn't load the stored value.\n{source}")]
    Load { node: String, source: StorageError },

    #[error("Node '{node}': couldn't save the computed value.\n{source}")]
    Save { node: String, source: StorageError },

    #[error("Node '{node}': couldn't prepare the storage location.\n{source}")]
    Prepare { node: String, source: StorageError },

    #[error("Node '{node}':\n{error}")]
    Computation { node: String, error: anyhow::Error },

    #[error("Node '{0}' depends on itself")]
    CyclicDependency(String),
}

impl EvalError {
    /// Name of the node whose evaluation failed.
    pub fn node(&self) -> &str {
        match self {
            EvalError::Lock { node, .. }
            | EvalError::Load { node, .. }
            | EvalError::Save { node, .. }
            | EvalError::Prepare { node, .. }
            | EvalError::Computation { node, .. } => node,
            EvalError::CyclicDependency(node) => node,
        }
    }

    /// True when the failure is caused by another holder of the artifact lock.
    pub fn is_lock_held(&self) -> bool {
        matches!(
            self,
            EvalError::Lock {
                source: LockError::Held(_),
                ..
            }
        )
    }

    /// Returns the error raised by the user function, if that is what failed.
    pub fn computation(&self) -> Option<&anyhow::Error> {
        match self {
            EvalError::Computation { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EvalError::Lock {
                source: LockError::Held(_),
                ..
            } => ErrorKind::Contention,
            EvalError::Lock { .. }
            | EvalError::Load { .. }
            | EvalError::Save { .. }
            | EvalError::Prepare { .. } => ErrorKind::Storage,
            EvalError::Computation { .. } => ErrorKind::Computation,
            EvalError::CyclicDependency(_) => ErrorKind::Configuration,
        }
    }
}

/// Coarse classification of failures, for callers who need to tell caller
/// misuse apart from environment problems and from failing user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The graph was set up incorrectly.
    Configuration,
    /// Another process holds the artifact lock.
    Contention,
    /// The storage location or the lock marker couldn't be used.
    Storage,
    /// The wrapped function failed.
    Computation,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error while configuring the graph:\n{0}")]
    Graph(#[from] GraphError),

    #[error("Error while evaluating the graph:\n{0}")]
    Eval(#[from] EvalError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Graph(_) => ErrorKind::Configuration,
            Error::Eval(err) => err.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let held = EvalError::Lock {
            node: "a".into(),
            source: LockError::Held("a.lock".into()),
        };
        assert!(held.is_lock_held());
        assert_eq!(held.kind(), ErrorKind::Contention);

        let load = EvalError::Load {
            node: "b".into(),
            source: StorageError::NotFound("b".into()),
        };
        assert_eq!(Error::from(load).kind(), ErrorKind::Storage);

        let dup = GraphError::DuplicateNodeName("c".into());
        assert_eq!(Error::from(dup).kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_computation_is_not_rewrapped() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        let err = EvalError::Computation {
            node: "d".into(),
            error: anyhow::Error::new(Boom),
        };

        assert_eq!(err.node(), "d");
        assert_eq!(err.kind(), ErrorKind::Computation);
        assert!(err.computation().unwrap().downcast_ref::<Boom>().is_some());
    }
}
