#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod config;
mod engine;
mod error;
mod graph;
mod lock;
mod node;
pub mod storage;
mod utils;

pub use serde_json::{Value, json};

pub use crate::cache::Cache;
pub use crate::config::{Config, ENV_ROOT};
pub use crate::engine::Poll;
pub use crate::error::*;
pub use crate::graph::{BackendRef, Graph, NodeBuilder, VOLATILE};
pub use crate::lock::{Lock, LockGuard};
pub use crate::node::{Arg, ArgKey, Inputs, Node, NodeFn};
pub use crate::storage::{
    Artifact, Backend, CborBackend, FileBackend, JsonBackend, MemoryBackend, VolatileBackend,
};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
