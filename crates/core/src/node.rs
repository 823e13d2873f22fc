//! Nodes: named units of work with declared dependencies.

use crate::cache::{CacheStats, CacheStore};
use crate::context::RunOptions;
use crate::dag::{Detached, DependencyGraph};
use crate::error::{DagError, Result};
use crate::executor;
use crate::types::{NodeId, NodeInputs, ValueKind};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

/// Synchronous node body
pub type SyncFn = dyn Fn(&NodeInputs) -> anyhow::Result<Value> + Send + Sync;

/// Suspend-capable node body
pub type AsyncFn = dyn Fn(NodeInputs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// The unit of work a node wraps
#[derive(Clone)]
pub enum Compute {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

impl Compute {
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl std::fmt::Debug for Compute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Compute::Sync"),
            Self::Async(_) => f.write_str("Compute::Async"),
        }
    }
}

/// Per-node execution options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOptions {
    /// Keep results per resolved input binding across runs
    #[serde(default = "default_true")]
    pub cache: bool,
    /// Check bound values and output against their declared kinds
    #[serde(default = "default_true")]
    pub validate_types: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            cache: true,
            validate_types: true,
        }
    }
}

/// How a dependency is referenced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyRef {
    /// A node handle
    Node(Node),
    /// A node name, resolved against a registry when the graph is built
    Named(String),
}

impl DependencyRef {
    /// Name of the referenced node
    pub fn name(&self) -> &str {
        match self {
            Self::Node(node) => node.name(),
            Self::Named(name) => name,
        }
    }
}

impl From<Node> for DependencyRef {
    fn from(node: Node) -> Self {
        Self::Node(node)
    }
}

impl From<&Node> for DependencyRef {
    fn from(node: &Node) -> Self {
        Self::Node(node.clone())
    }
}

impl From<&str> for DependencyRef {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for DependencyRef {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

/// An edge to another node and the label its result is bound under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub target: DependencyRef,
    pub binding: String,
    pub kind: ValueKind,
}

impl Dependency {
    /// Bind the dependency under its own name
    pub fn new(target: impl Into<DependencyRef>) -> Self {
        let target = target.into();
        Self {
            binding: target.name().to_string(),
            target,
            kind: ValueKind::Any,
        }
    }

    pub fn bind_as(mut self, binding: impl Into<String>) -> Self {
        self.binding = binding.into();
        self
    }

    pub fn kind(mut self, kind: ValueKind) -> Self {
        self.kind = kind;
        self
    }
}

/// An explicit input parameter, filled from run inputs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Param {
    pub name: String,
    pub kind: ValueKind,
    pub default: Option<Value>,
}

struct NodeInner {
    id: NodeId,
    name: String,
    dependencies: Vec<Dependency>,
    params: Vec<Param>,
    returns: Option<ValueKind>,
    compute: Compute,
    options: NodeOptions,
    cache: CacheStore,
}

/// Handle to a declared node.
///
/// Cloning is cheap and clones refer to the same node: they share identity and cache store.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn builder(name: impl Into<String>) -> NodeBuilder {
        NodeBuilder::new(name)
    }

    /// A node that returns the run input of the same name unchanged
    pub fn input(name: impl Into<String>, kind: ValueKind) -> Node {
        let name = name.into();
        let key = name.clone();
        Node::from_parts(
            name.clone(),
            Vec::new(),
            vec![Param {
                name,
                kind,
                default: None,
            }],
            None,
            Compute::Sync(Arc::new(
                move |inputs: &NodeInputs| -> anyhow::Result<Value> {
                    Ok(inputs.value(&key)?.clone())
                },
            )),
            NodeOptions {
                cache: false,
                validate_types: true,
            },
        )
    }

    fn from_parts(
        name: String,
        dependencies: Vec<Dependency>,
        params: Vec<Param>,
        returns: Option<ValueKind>,
        compute: Compute,
        options: NodeOptions,
    ) -> Node {
        Node {
            inner: Arc::new(NodeInner {
                id: NodeId::next(),
                name,
                dependencies,
                params,
                returns,
                compute,
                options,
                cache: CacheStore::new(),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.inner.dependencies
    }

    pub fn params(&self) -> &[Param] {
        &self.inner.params
    }

    /// Declared output kind
    pub fn returns(&self) -> Option<ValueKind> {
        self.inner.returns
    }

    pub fn compute(&self) -> &Compute {
        &self.inner.compute
    }

    pub fn options(&self) -> NodeOptions {
        self.inner.options
    }

    pub fn is_async(&self) -> bool {
        self.inner.compute.is_async()
    }

    /// Whether this node or any dependency reachable through handles is async.
    ///
    /// Dependencies referenced by name are not followed; use [`DependencyGraph::has_async`] on a
    /// built graph for a complete answer.
    pub fn has_async(&self) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![self.clone()];
        while let Some(node) = stack.pop() {
            if !visited.insert(node.id()) {
                continue;
            }
            if node.is_async() {
                return true;
            }
            for dep in node.dependencies() {
                if let DependencyRef::Node(target) = &dep.target {
                    stack.push(target.clone());
                }
            }
        }
        false
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Drop every cached result of this node
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    pub(crate) fn cache_store(&self) -> &CacheStore {
        &self.inner.cache
    }

    /// Build this node's dependency closure without a registry
    pub fn graph(&self) -> Result<DependencyGraph> {
        DependencyGraph::build(std::slice::from_ref(self), &Detached)
    }

    /// Run this node sequentially with default options
    pub fn run(&self, inputs: NodeInputs) -> Result<Value> {
        self.run_with(inputs, RunOptions::default())
    }

    pub fn run_with(&self, inputs: NodeInputs, options: RunOptions) -> Result<Value> {
        let graph = self.graph()?;
        let outputs = executor::execute(&graph, inputs, options)?;
        executor::single_output(outputs, self.name())
    }

    /// Run this node with layered concurrent dispatch
    pub async fn run_concurrent(&self, inputs: NodeInputs) -> Result<Value> {
        self.run_concurrent_with(inputs, RunOptions::default()).await
    }

    pub async fn run_concurrent_with(&self, inputs: NodeInputs, options: RunOptions) -> Result<Value> {
        let graph = self.graph()?;
        let outputs = executor::execute_concurrent(&graph, inputs, options).await?;
        executor::single_output(outputs, self.name())
    }

    /// Run this node off the calling task and wait for the result
    pub async fn run_on_worker(&self, inputs: NodeInputs) -> Result<Value> {
        let graph = self.graph()?;
        let outputs = executor::execute_on_worker(graph, inputs, RunOptions::default()).await?;
        executor::single_output(outputs, self.name())
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("name", &self.name())
            .field(
                "dependencies",
                &self
                    .dependencies()
                    .iter()
                    .map(|d| d.target.name())
                    .collect::<Vec<_>>(),
            )
            .field("compute", self.compute())
            .field("options", &self.options())
            .finish()
    }
}

/// Declares a node. Finish with [`NodeBuilder::build`] or [`NodeBuilder::build_async`].
pub struct NodeBuilder {
    name: String,
    dependencies: Vec<Dependency>,
    params: Vec<Param>,
    returns: Option<ValueKind>,
    options: NodeOptions,
}

impl NodeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            params: Vec::new(),
            returns: None,
            options: NodeOptions::default(),
        }
    }

    /// Depend on a node (handle or name), bound under its name
    pub fn depends_on(self, target: impl Into<DependencyRef>) -> Self {
        self.dependency(Dependency::new(target))
    }

    /// Depend on a node, bound under `binding`
    pub fn depends_on_as(self, binding: impl Into<String>, target: impl Into<DependencyRef>) -> Self {
        self.dependency(Dependency::new(target).bind_as(binding))
    }

    pub fn dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Declare a required run input
    pub fn input(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.params.push(Param {
            name: name.into(),
            kind,
            default: None,
        });
        self
    }

    /// Declare a run input that falls back to `default`
    pub fn optional_input(
        mut self,
        name: impl Into<String>,
        kind: ValueKind,
        default: impl Into<Value>,
    ) -> Self {
        self.params.push(Param {
            name: name.into(),
            kind,
            default: Some(default.into()),
        });
        self
    }

    pub fn returns(mut self, kind: ValueKind) -> Self {
        self.returns = Some(kind);
        self
    }

    pub fn cache(mut self, enabled: bool) -> Self {
        self.options.cache = enabled;
        self
    }

    pub fn validate_types(mut self, enabled: bool) -> Self {
        self.options.validate_types = enabled;
        self
    }

    pub fn options(mut self, options: NodeOptions) -> Self {
        self.options = options;
        self
    }

    /// Finish with a synchronous body
    pub fn build<F>(self, f: F) -> Result<Node>
    where
        F: Fn(&NodeInputs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.finish(Compute::Sync(Arc::new(f)))
    }

    /// Finish with an async body
    pub fn build_async<F, Fut>(self, f: F) -> Result<Node>
    where
        F: Fn(NodeInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.finish(Compute::Async(Arc::new(
            move |inputs: NodeInputs| -> BoxFuture<'static, anyhow::Result<Value>> {
                f(inputs).boxed()
            },
        )))
    }

    fn finish(self, compute: Compute) -> Result<Node> {
        let mut labels = HashSet::new();
        let bindings = self.dependencies.iter().map(|d| &d.binding);
        let params = self.params.iter().map(|p| &p.name);
        for label in bindings.chain(params) {
            if !labels.insert(label.as_str()) {
                let binding = label.clone();
                return Err(DagError::BindingConflict {
                    node: self.name,
                    binding,
                });
            }
        }

        Ok(Node::from_parts(
            self.name,
            self.dependencies,
            self.params,
            self.returns,
            compute,
            self.options,
        ))
    }
}
