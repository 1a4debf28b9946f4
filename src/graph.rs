use std::any::type_name;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use console::style;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::Value;
use crate::cache::Cache;
use crate::config::Config;
use crate::error::{EvalError, GraphError};
use crate::node::{Arg, Inputs, Node, NodeData, NodeFn};
use crate::storage::{Backend, VolatileBackend};

/// Name under which every graph registers its [`VolatileBackend`].
pub const VOLATILE: &str = "none";

/// Parameter names of the node constructor; named arguments may not use them.
const RESERVED: &[&str] = &[
    "func", "name", "backend", "args", "kwargs", "cache", "register", "key",
];

/// Which backend a node should be bound to.
#[derive(Clone)]
pub enum BackendRef {
    /// A backend registered in the graph under this name.
    Named(String),
    /// A backend instance, used as is.
    Handle(Arc<dyn Backend>),
}

impl From<&str> for BackendRef {
    fn from(name: &str) -> Self {
        BackendRef::Named(name.to_string())
    }
}

impl From<String> for BackendRef {
    fn from(name: String) -> Self {
        BackendRef::Named(name)
    }
}

impl From<Arc<dyn Backend>> for BackendRef {
    fn from(backend: Arc<dyn Backend>) -> Self {
        BackendRef::Handle(backend)
    }
}

/// A registry of nodes and of the backends they store their values in.
///
/// Nodes are added with [`Graph::node`] and are kept in registration order,
/// which is the order [`Graph::evaluate_all`] visits them in.
///
/// # Example
///
/// ```rust
/// use lazygraph::{Graph, json};
///
/// let mut graph = Graph::new();
///
/// let load = graph
///     .node(|_| Ok(json!([[1, 2, 3], [4, 5, 6]])))
///     .name("load")
///     .build()?;
///
/// let max_row = graph
///     .node(|inputs| {
///         let data: Vec<Vec<i64>> = inputs.parse("data")?;
///         let max: Vec<i64> = data.iter().filter_map(|row| row.iter().max().copied()).collect();
///         Ok(json!(max))
///     })
///     .name("max_row")
///     .kwarg("data", &load)
///     .build()?;
///
/// assert_eq!(max_row.evaluate()?, json!([3, 6]));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Graph {
    name: String,
    backends: BTreeMap<String, Arc<dyn Backend>>,
    default_backend: Option<String>,
    nodes: Vec<(String, Node)>,
    keys: HashMap<String, usize>,
    names: HashSet<String>,
    cache: Arc<Cache>,
    config: Arc<Config>,
}

impl Graph {
    /// Creates a graph with a random name.
    pub fn new() -> Self {
        Self::named(uuid::Uuid::new_v4().to_string())
    }

    pub fn named(name: impl AsRef<str>) -> Self {
        let mut backends: BTreeMap<String, Arc<dyn Backend>> = BTreeMap::new();
        backends.insert(VOLATILE.to_string(), Arc::new(VolatileBackend::new()));

        Self {
            name: name.as_ref().to_lowercase(),
            backends,
            default_backend: None,
            nodes: Vec::new(),
            keys: HashMap::new(),
            names: HashSet::new(),
            cache: Arc::new(Cache::new()),
            config: Arc::new(Config::from_env()),
        }
    }

    /// Uses `cache` for memoization instead of a private one. Affects nodes
    /// created afterwards.
    pub fn with_cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = cache;
        self
    }

    /// Affects nodes created afterwards.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers a backend under `name`, optionally making it the one used by
    /// nodes that don't ask for a specific backend.
    pub fn add_backend<B>(
        &mut self,
        name: impl Into<String>,
        backend: B,
        make_default: bool,
    ) -> Result<(), GraphError>
    where
        B: Backend + 'static,
    {
        self.add_backend_shared(name, Arc::new(backend), make_default)
    }

    pub fn add_backend_shared(
        &mut self,
        name: impl Into<String>,
        backend: Arc<dyn Backend>,
        make_default: bool,
    ) -> Result<(), GraphError> {
        let name = name.into();

        if self.backends.contains_key(&name) {
            tracing::error!("the backend {name} has already been added");
            return Err(GraphError::DuplicateBackend(name));
        }

        self.backends.insert(name.clone(), backend);

        if make_default {
            self.default_backend = Some(name);
        }

        Ok(())
    }

    pub fn set_default_backend(&mut self, name: &str) -> Result<(), GraphError> {
        if !self.backends.contains_key(name) {
            return Err(self.unknown_backend(name));
        }

        self.default_backend = Some(name.to_string());
        Ok(())
    }

    pub fn default_backend(&self) -> Option<&str> {
        self.default_backend.as_deref()
    }

    pub fn backend(&self, name: &str) -> Option<&Arc<dyn Backend>> {
        self.backends.get(name)
    }

    /// Starts defining a node wrapping `func`.
    pub fn node<F>(&mut self, func: F) -> NodeBuilder<'_>
    where
        F: Fn(&Inputs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        NodeBuilder {
            graph: self,
            func: Box::new(func),
            func_name: Cow::Borrowed(short_type_name(type_name::<F>())),
            name: None,
            key: None,
            backend: None,
            args: Vec::new(),
            kwargs: Vec::new(),
            use_cache: true,
            register: true,
        }
    }

    /// Registered node stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.keys.get(key).map(|&index| &self.nodes[index].1)
    }

    /// Registered nodes with their keys, in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.nodes.iter().map(|(key, node)| (key.as_str(), node))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Evaluates every registered node in registration order and returns the
    /// values with their node keys, in that same order. Nodes whose value is
    /// already stored are skipped unless `force` is set, and don't appear in
    /// the result.
    pub fn evaluate_all(&self, force: bool) -> Result<Vec<(String, Value)>, EvalError> {
        let span = tracing::info_span!("evaluate_all", graph = %self.name);
        span.pb_set_length(self.nodes.len() as u64);
        span.pb_set_style(&crate::utils::PROGRESS_STYLE);
        span.pb_set_message("Evaluating nodes...");
        let _enter = span.enter();

        let s = std::time::Instant::now();
        let mut evaluations = Vec::new();

        for (key, node) in &self.nodes {
            if !force && node.exists() {
                span.pb_inc(1);
                continue;
            }

            let short = self.config.display_name(key);
            tracing::info!(node = %style(&short).cyan(), "evaluating...");
            span.pb_set_message(&short);

            let value = node.evaluate()?;
            evaluations.push((key.clone(), value));
            span.pb_inc(1);
        }

        tracing::info!(
            "evaluated {} of {} nodes {}",
            evaluations.len(),
            self.nodes.len(),
            crate::utils::as_overhead(s)
        );

        Ok(evaluations)
    }

    fn unknown_backend(&self, name: &str) -> GraphError {
        let available = self.backends.keys().cloned().collect::<Vec<_>>().join(", ");
        tracing::error!("the backend {name} is not found in [{available}]");
        GraphError::UnknownBackend(name.to_string(), available)
    }

    fn resolve_backend(
        &self,
        backend: Option<BackendRef>,
        use_cache: bool,
    ) -> Result<Arc<dyn Backend>, GraphError> {
        if !use_cache {
            return Ok(self.volatile());
        }

        match backend {
            Some(BackendRef::Handle(backend)) => Ok(backend),
            Some(BackendRef::Named(name)) => self
                .backends
                .get(&name)
                .cloned()
                .ok_or_else(|| self.unknown_backend(&name)),
            None => match &self.default_backend {
                Some(name) => self
                    .backends
                    .get(name)
                    .cloned()
                    .ok_or_else(|| self.unknown_backend(name)),
                None => Ok(self.volatile()),
            },
        }
    }

    fn volatile(&self) -> Arc<dyn Backend> {
        self.backends
            .get(VOLATILE)
            .cloned()
            .unwrap_or_else(|| Arc::new(VolatileBackend::new()))
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut nodes: Vec<_> = self.keys.keys().collect();
        nodes.sort();

        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("nodes", &nodes)
            .finish()
    }
}

/// Definition of a node in progress, see [`Graph::node`].
pub struct NodeBuilder<'a> {
    graph: &'a mut Graph,
    func: Box<NodeFn>,
    func_name: Cow<'static, str>,
    name: Option<String>,
    key: Option<String>,
    backend: Option<BackendRef>,
    args: Vec<Arg>,
    kwargs: Vec<(String, Arg)>,
    use_cache: bool,
    register: bool,
}

impl<'a> NodeBuilder<'a> {
    /// Name of the node and of its stored value. A random one is generated
    /// when left out.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Key under which the node is registered in the graph, if different from
    /// its name.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Function name shown in the node's `Debug` output. Defaults to the
    /// name of the function's type.
    pub fn func_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.func_name = name.into();
        self
    }

    /// Backend to bind the node to, by registered name or as an instance.
    /// Defaults to the graph's default backend.
    pub fn backend(mut self, backend: impl Into<BackendRef>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// Appends a positional argument.
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds a named argument.
    pub fn kwarg(mut self, name: impl Into<String>, arg: impl Into<Arg>) -> Self {
        self.kwargs.push((name.into(), arg.into()));
        self
    }

    /// With `false`, the node is bound to the volatile backend no matter what
    /// else was requested, so its value is never stored.
    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// With `false`, the node is created but not added to the graph.
    pub fn register(mut self, register: bool) -> Self {
        self.register = register;
        self
    }

    pub fn build(self) -> Result<Node, GraphError> {
        let graph = self.graph;

        let name = match self.name {
            Some(name) if name.is_empty() => {
                return Err(GraphError::InvalidArgument(
                    "node name must not be empty".into(),
                ));
            }
            Some(name) => name,
            None => uuid::Uuid::new_v4().to_string(),
        };

        // Names double as storage paths, they must stay inside the backend.
        let escapes = name.starts_with('/')
            || name.contains('\\')
            || name
                .split('/')
                .any(|part| part.is_empty() || part == "." || part == "..");
        if escapes {
            return Err(GraphError::InvalidArgument(format!(
                "node name '{name}' must be a relative path without empty, '.' or '..' components"
            )));
        }

        if graph.names.contains(&name) || graph.keys.contains_key(&name) {
            return Err(GraphError::DuplicateNodeName(name));
        }

        let key = self.key.unwrap_or_else(|| name.clone());
        if self.register && (graph.keys.contains_key(&key) || graph.names.contains(&key)) {
            return Err(GraphError::DuplicateNodeName(key));
        }

        let mut kwargs = BTreeMap::new();
        for (arg, value) in self.kwargs {
            if arg.is_empty() {
                return Err(GraphError::InvalidArgument(format!(
                    "node '{name}' has a named argument with an empty name"
                )));
            }
            if RESERVED.contains(&arg.as_str()) {
                return Err(GraphError::InvalidArgument(format!(
                    "node '{name}' uses the reserved argument name '{arg}'"
                )));
            }
            if kwargs.insert(arg.clone(), value).is_some() {
                return Err(GraphError::InvalidArgument(format!(
                    "node '{name}' has the argument '{arg}' twice"
                )));
            }
        }

        let backend = graph.resolve_backend(self.backend, self.use_cache)?;
        let artifact = backend.artifact(&name);

        let node = Node(Arc::new(NodeData {
            name: name.clone(),
            func: self.func,
            func_name: self.func_name,
            args: self.args,
            kwargs,
            backend,
            artifact,
            cache: graph.cache.clone(),
            config: graph.config.clone(),
        }));

        if self.register {
            graph.keys.insert(key.clone(), graph.nodes.len());
            graph.names.insert(name);
            graph.nodes.push((key, node.clone()));
        }

        Ok(node)
    }
}

/// `my_crate::module::function` becomes `function`, and a closure keeps the
/// name of the function it was defined in: `function::{{closure}}`.
fn short_type_name(name: &'static str) -> &'static str {
    let mut owner = name;
    while let Some(rest) = owner.strip_suffix("::{{closure}}") {
        owner = rest;
    }

    let start = owner.rfind("::").map_or(0, |index| index + 2);
    &name[start..]
}
