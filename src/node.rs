use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use anyhow::Context as _;
use serde::de::DeserializeOwned;

use crate::Value;
use crate::cache::Cache;
use crate::config::Config;
use crate::engine::{self, Poll};
use crate::error::{EvalError, StorageError};
use crate::storage::{Artifact, Backend};

/// The function wrapped by a node. It receives the node's arguments with
/// every dependency already replaced by its value.
///
/// Returning [`Value::Null`] means "nothing to keep": the result is handed
/// back to the caller but neither stored nor memoized.
pub type NodeFn = dyn Fn(&Inputs) -> anyhow::Result<Value> + Send + Sync;

/// An argument of a node: either a plain value or something to be computed.
///
/// Lists and maps may themselves contain nodes, which are evaluated in place
/// before the function runs.
#[derive(Clone)]
pub enum Arg {
    Node(Node),
    Literal(Value),
    List(Vec<Arg>),
    Map(BTreeMap<String, Arg>),
}

impl Arg {
    pub fn list<I, A>(items: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        Arg::List(items.into_iter().map(Into::into).collect())
    }

    pub fn map<I, K, A>(items: I) -> Self
    where
        I: IntoIterator<Item = (K, A)>,
        K: Into<String>,
        A: Into<Arg>,
    {
        Arg::Map(
            items
                .into_iter()
                .map(|(key, arg)| (key.into(), arg.into()))
                .collect(),
        )
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Arg::Node(node) => Some(node),
            _ => None,
        }
    }

    fn collect_nodes<'a>(&'a self, out: &mut Vec<&'a Node>) {
        match self {
            Arg::Node(node) => out.push(node),
            Arg::Literal(_) => {}
            Arg::List(items) => items.iter().for_each(|item| item.collect_nodes(out)),
            Arg::Map(items) => items.values().for_each(|item| item.collect_nodes(out)),
        }
    }
}

impl From<Node> for Arg {
    fn from(node: Node) -> Self {
        Arg::Node(node)
    }
}

impl From<&Node> for Arg {
    fn from(node: &Node) -> Self {
        Arg::Node(node.clone())
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Literal(value)
    }
}

impl Debug for Arg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arg::Node(node) => write!(f, "Node({})", node.name()),
            Arg::Literal(value) => write!(f, "{value}"),
            Arg::List(items) => f.debug_list().entries(items).finish(),
            Arg::Map(items) => f.debug_map().entries(items).finish(),
        }
    }
}

/// Position of an argument in a node's signature.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArgKey {
    Position(usize),
    Name(String),
}

impl Display for ArgKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgKey::Position(index) => write!(f, "{index}"),
            ArgKey::Name(name) => write!(f, "{name}"),
        }
    }
}

/// Resolved arguments passed to a [`NodeFn`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs {
    pub(crate) positional: Vec<Value>,
    pub(crate) named: BTreeMap<String, Value>,
}

impl Inputs {
    /// Positional argument at `index`.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// Named argument.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }

    pub fn args(&self) -> &[Value] {
        &self.positional
    }

    pub fn named(&self) -> &BTreeMap<String, Value> {
        &self.named
    }

    /// Deserializes the named argument into `T`.
    pub fn parse<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self
            .get(name)
            .with_context(|| format!("missing argument '{name}'"))?;

        serde_json::from_value(value.clone())
            .with_context(|| format!("argument '{name}' has an unexpected shape"))
    }

    /// Deserializes the positional argument at `index` into `T`.
    pub fn parse_arg<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self
            .arg(index)
            .with_context(|| format!("missing positional argument {index}"))?;

        serde_json::from_value(value.clone())
            .with_context(|| format!("positional argument {index} has an unexpected shape"))
    }
}

pub(crate) struct NodeData {
    pub name: String,
    pub func: Box<NodeFn>,
    pub func_name: Cow<'static, str>,
    pub args: Vec<Arg>,
    pub kwargs: BTreeMap<String, Arg>,
    pub backend: Arc<dyn Backend>,
    pub artifact: Box<dyn Artifact>,
    pub cache: Arc<Cache>,
    pub config: Arc<Config>,
}

/// A named, deferred computation.
///
/// Nodes are created through [`Graph::node`](crate::Graph::node) and are
/// immutable afterwards. The handle is cheap to clone; clones refer to the
/// same node. Passing a node as an argument of another node makes it a
/// dependency, and evaluating the sink evaluates the source first.
///
/// # Diamond dependencies
///
/// A node used by several sinks is computed once per process: the first
/// evaluation memoizes its value, later ones return it straight away.
#[derive(Clone)]
pub struct Node(pub(crate) Arc<NodeData>);

impl Node {
    /// Name of the node, also the key under which its value is stored.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.0.backend
    }

    /// The storage handle this node is bound to.
    pub fn artifact(&self) -> &dyn Artifact {
        self.0.artifact.as_ref()
    }

    pub(crate) fn cache(&self) -> &Cache {
        &self.0.cache
    }

    pub(crate) fn config(&self) -> &Config {
        &self.0.config
    }

    /// Arguments which are nodes themselves.
    pub fn sources(&self) -> Vec<(ArgKey, &Node)> {
        self.entries()
            .filter_map(|(key, arg)| arg.as_node().map(|node| (key, node)))
            .collect()
    }

    /// Arguments which are not nodes.
    pub fn keywords(&self) -> Vec<(ArgKey, &Arg)> {
        self.entries()
            .filter(|(_, arg)| arg.as_node().is_none())
            .collect()
    }

    /// Every node this node depends on directly, including those nested in
    /// list and map arguments, in resolution order.
    pub fn dependencies(&self) -> Vec<&Node> {
        let mut out = Vec::new();
        for (_, arg) in self.entries() {
            arg.collect_nodes(&mut out);
        }
        out
    }

    /// Whether a value for this node is already stored. Always false for
    /// nodes that aren't bound to persistent storage.
    pub fn exists(&self) -> bool {
        self.0.artifact.exists()
    }

    /// Whether this node's value is memoized in the in-memory cache.
    pub fn is_cached(&self) -> bool {
        self.0.cache.contains(&self.0.name)
    }

    /// Returns the value of this node, computing it and its dependencies if
    /// they are neither memoized nor stored.
    pub fn evaluate(&self) -> Result<Value, EvalError> {
        engine::evaluate(self)
    }

    /// Like [`Node::evaluate`], but retries while the artifact lock of this
    /// node or one of its dependencies is held by someone else.
    pub fn evaluate_polling(&self, poll: &Poll) -> Result<Value, EvalError> {
        engine::evaluate_polling(self, poll)
    }

    /// Removes the stored value. The in-memory cache is left untouched.
    pub fn delete(&self) -> Result<(), StorageError> {
        self.0.artifact.delete()
    }

    /// Positional arguments first, then named ones in key order. This is also
    /// the order in which dependencies get evaluated.
    fn entries(&self) -> impl Iterator<Item = (ArgKey, &Arg)> {
        let positional = self
            .0
            .args
            .iter()
            .enumerate()
            .map(|(index, arg)| (ArgKey::Position(index), arg));

        let named = self
            .0
            .kwargs
            .iter()
            .map(|(name, arg)| (ArgKey::Name(name.clone()), arg));

        positional.chain(named)
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sources: Vec<_> = self.sources().iter().map(|(key, _)| key.to_string()).collect();
        let kwargs: Vec<_> = self.keywords().iter().map(|(key, _)| key.to_string()).collect();

        f.debug_struct("Node")
            .field("name", &self.0.name)
            .field("sources", &sources)
            .field("func", &self.0.func_name)
            .field("kwargs", &kwargs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Graph;
    use serde_json::json;

    #[test]
    fn test_sources_and_keywords() {
        let mut graph = Graph::new();

        let data = graph.node(|_| Ok(json!([1, 2]))).name("data").build().unwrap();
        let scale = graph
            .node(|inputs| {
                let data: Vec<i64> = inputs.parse("data")?;
                let scale: i64 = inputs.parse("scale")?;
                Ok(json!(data.iter().map(|d| d * scale).collect::<Vec<_>>()))
            })
            .name("scale")
            .arg(&data)
            .kwarg("data", &data)
            .kwarg("scale", json!(3))
            .build()
            .unwrap();

        let sources: Vec<_> = scale.sources().into_iter().map(|(key, _)| key).collect();
        assert_eq!(
            sources,
            vec![ArgKey::Position(0), ArgKey::Name("data".into())]
        );

        let keywords: Vec<_> = scale.keywords().into_iter().map(|(key, _)| key).collect();
        assert_eq!(keywords, vec![ArgKey::Name("scale".into())]);
    }

    #[test]
    fn test_dependencies_include_nested() {
        let mut graph = Graph::new();

        let a = graph.node(|_| Ok(json!(1))).name("a").build().unwrap();
        let b = graph.node(|_| Ok(json!(2))).name("b").build().unwrap();
        let c = graph
            .node(|_| Ok(Value::Null))
            .name("c")
            .kwarg("items", Arg::list([&a, &b]))
            .kwarg("lookup", Arg::map([("x", Arg::from(&a))]))
            .build()
            .unwrap();

        assert!(c.sources().is_empty());
        let names: Vec<_> = c.dependencies().iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["a", "b", "a"]);
    }

    #[test]
    fn test_debug_lists_argument_roles() {
        let mut graph = Graph::new();

        let a = graph.node(|_| Ok(json!(1))).name("a").build().unwrap();
        let b = graph
            .node(|_| Ok(json!(2)))
            .name("b")
            .kwarg("data", &a)
            .kwarg("x", json!(3))
            .build()
            .unwrap();

        let repr = format!("{b:?}");
        assert!(repr.contains(r#"sources: ["data"]"#));
        assert!(repr.contains(r#"kwargs: ["x"]"#));
    }

    #[test]
    fn test_inputs_parse() {
        let inputs = Inputs {
            positional: vec![json!("first")],
            named: BTreeMap::from([("data".to_string(), json!([[1, 2, 3], [4, 5, 6]]))]),
        };

        let data: Vec<Vec<i64>> = inputs.parse("data").unwrap();
        assert_eq!(data, vec![vec![1, 2, 3], vec![4, 5, 6]]);

        let first: String = inputs.parse_arg(0).unwrap();
        assert_eq!(first, "first");

        assert!(inputs.parse::<i64>("missing").is_err());
        assert!(inputs.parse::<String>("data").is_err());
    }
}
