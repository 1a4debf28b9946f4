//! The compute-or-load algorithm.
//!
//! Evaluating a node walks its arguments depth-first; there is no separate
//! scheduling pass. For every node reached, in order:
//!
//! 1. A memoized value is returned as is, without touching storage.
//! 2. A stored value is loaded. A failing load is fatal for the evaluation,
//!    it never falls back to recomputing.
//! 3. Otherwise the artifact lock is taken, the arguments are resolved
//!    recursively, the function runs and its result is stored. The lock is
//!    released on every way out of this step.
//!
//! Values that are not [`Value::Null`] are then memoized if the node's backend
//! asks for it. Nothing is retried: the first error ends the evaluation and
//! leaves neither a stored artifact nor a cache entry behind.

use std::time::{Duration, Instant};

use console::style;
use serde_json::Map;

use crate::Value;
use crate::error::EvalError;
use crate::node::{Arg, Inputs, Node};

/// How [`Node::evaluate_polling`] waits for a lock held by someone else.
#[derive(Debug, Clone, Copy)]
pub struct Poll {
    /// Total number of evaluation attempts, including the first one.
    pub attempts: usize,
    /// Pause between attempts.
    pub interval: Duration,
}

impl Default for Poll {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_secs(1),
        }
    }
}

pub(crate) fn evaluate(node: &Node) -> Result<Value, EvalError> {
    let mut chain = Vec::new();
    compute_or_load(node, &mut chain)
}

pub(crate) fn evaluate_polling(node: &Node, poll: &Poll) -> Result<Value, EvalError> {
    let mut attempt = 1;

    loop {
        match evaluate(node) {
            Err(err) if err.is_lock_held() && attempt < poll.attempts => {
                tracing::debug!(
                    node = %node.config().display_name(node.name()),
                    attempt,
                    "waiting for lock: {err}"
                );
                std::thread::sleep(poll.interval);
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// `chain` holds the names of the nodes being computed further up the
/// current path.
fn compute_or_load(node: &Node, chain: &mut Vec<String>) -> Result<Value, EvalError> {
    let name = node.name();
    let short = node.config().display_name(name);

    if let Some(value) = node.cache().get(name) {
        tracing::info!(node = %style(&short).cyan(), "loading from local cache");
        return Ok(value);
    }

    if chain.iter().any(|item| item == name) {
        tracing::error!(node = %style(&short).cyan(), "node depends on itself");
        return Err(EvalError::CyclicDependency(name.to_string()));
    }

    let value = if node.artifact().exists() {
        load(node, &short)?
    } else {
        chain.push(name.to_string());
        let result = compute(node, &short, chain);
        chain.pop();
        result?
    };

    if node.backend().caches_results() && !value.is_null() {
        node.cache().insert(name, value.clone());
    }

    Ok(value)
}

fn load(node: &Node, short: &str) -> Result<Value, EvalError> {
    tracing::info!(node = %style(short).cyan(), "loading from storage");

    node.artifact().load().map_err(|source| {
        tracing::error!(node = %style(short).cyan(), "failed to load: {source}");
        EvalError::Load {
            node: node.name().to_string(),
            source,
        }
    })
}

fn compute(node: &Node, short: &str, chain: &mut Vec<String>) -> Result<Value, EvalError> {
    let artifact = node.artifact();

    artifact.prepare().map_err(|source| EvalError::Prepare {
        node: node.name().to_string(),
        source,
    })?;

    let _guard = artifact.lock().scoped().map_err(|source| {
        tracing::error!(node = %style(short).cyan(), "failed to lock: {source}");
        EvalError::Lock {
            node: node.name().to_string(),
            source,
        }
    })?;

    // Someone else may have stored the value between the existence check and
    // taking the lock.
    if artifact.exists() {
        return load(node, short);
    }

    let inputs = resolve_inputs(node, chain)?;

    tracing::info!(node = %style(short).cyan(), "calculating...");
    let s = Instant::now();

    let value = (node.0.func)(&inputs).map_err(|error| {
        tracing::error!(node = %style(short).cyan(), "computation failed: {error:#}");
        EvalError::Computation {
            node: node.name().to_string(),
            error,
        }
    })?;

    tracing::info!(
        node = %style(short).cyan(),
        "calculated {}",
        crate::utils::as_overhead(s)
    );

    if !value.is_null() {
        tracing::info!(node = %style(short).cyan(), "saving to storage");
        artifact.save(&value).map_err(|source| {
            tracing::error!(node = %style(short).cyan(), "failed to save: {source}");
            EvalError::Save {
                node: node.name().to_string(),
                source,
            }
        })?;
    }

    Ok(value)
}

fn resolve_inputs(node: &Node, chain: &mut Vec<String>) -> Result<Inputs, EvalError> {
    let mut inputs = Inputs::default();

    for arg in &node.0.args {
        inputs.positional.push(resolve(arg, chain)?);
    }

    for (name, arg) in &node.0.kwargs {
        inputs.named.insert(name.clone(), resolve(arg, chain)?);
    }

    Ok(inputs)
}

fn resolve(arg: &Arg, chain: &mut Vec<String>) -> Result<Value, EvalError> {
    match arg {
        Arg::Node(node) => compute_or_load(node, chain),
        Arg::Literal(value) => Ok(value.clone()),
        Arg::List(items) => items
            .iter()
            .map(|item| resolve(item, chain))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Arg::Map(items) => items
            .iter()
            .map(|(key, item)| Ok((key.clone(), resolve(item, chain)?)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
    }
}
