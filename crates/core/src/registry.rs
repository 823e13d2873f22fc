//! Named collections of nodes.

use crate::config::EngineConfig;
use crate::context::RunOptions;
use crate::dag::{DependencyGraph, NodeResolver};
use crate::error::{DagError, Result};
use crate::executor::{self, Outputs};
use crate::node::{Node, NodeBuilder};
use crate::types::NodeInputs;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashSet;

/// Name of the process-wide registry
pub const DEFAULT_REGISTRY: &str = "default";

/// A namespace of uniquely named nodes.
///
/// Nodes keep registration order, which is the order terminal nodes and views are reported in.
/// Dependencies declared by name resolve against the registry when a graph is built.
pub struct Registry {
    name: String,
    nodes: RwLock<IndexMap<String, Node>>,
    config: EngineConfig,
}

impl Registry {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, EngineConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            name: name.into(),
            nodes: RwLock::new(IndexMap::new()),
            config,
        }
    }

    /// The process-wide registry.
    ///
    /// Created with default configuration on first use and kept for the lifetime of the process;
    /// it is never reset. Prefer passing an explicit registry where feasible.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceCell<Registry> = OnceCell::new();
        GLOBAL.get_or_init(|| Registry::new(DEFAULT_REGISTRY))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run options derived from this registry's configuration
    pub fn default_options(&self) -> RunOptions {
        RunOptions::from_config(&self.config)
    }

    /// Start declaring a node with this registry's default options
    pub fn builder(&self, name: impl Into<String>) -> NodeBuilder {
        NodeBuilder::new(name).options(self.config.node_options())
    }

    /// Register a node. Registering the same node twice is a no-op.
    pub fn register(&self, node: Node) -> Result<Node> {
        let mut nodes = self.nodes.write();
        match nodes.get(node.name()).map(Node::id) {
            Some(existing) if existing != node.id() => Err(DagError::DuplicateName {
                name: node.name().to_string(),
            }),
            Some(_) => Ok(node),
            None => {
                tracing::debug!("Registering node {} in registry {}", node.name(), self.name);
                nodes.insert(node.name().to_string(), node.clone());
                Ok(node)
            }
        }
    }

    /// Register several nodes. Either all are registered or, on a name conflict, none are.
    pub fn register_all(&self, batch: impl IntoIterator<Item = Node>) -> Result<()> {
        let batch: Vec<Node> = batch.into_iter().collect();
        let mut nodes = self.nodes.write();

        let mut claimed: IndexMap<&str, &Node> = IndexMap::new();
        for node in &batch {
            let taken = nodes
                .get(node.name())
                .or_else(|| claimed.get(node.name()).copied());
            if matches!(taken, Some(existing) if existing != node) {
                return Err(DagError::DuplicateName {
                    name: node.name().to_string(),
                });
            }
            claimed.insert(node.name(), node);
        }

        for node in &batch {
            nodes
                .entry(node.name().to_string())
                .or_insert_with(|| node.clone());
        }
        tracing::debug!("Registered {} node(s) in registry {}", batch.len(), self.name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Node> {
        self.nodes.read().get(name).cloned()
    }

    /// Look up a node, failing with `UnknownNode`
    pub fn node(&self, name: &str) -> Result<Node> {
        self.get(name).ok_or_else(|| DagError::UnknownNode {
            registry: self.name.clone(),
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Every registered node, in registration order
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.read().keys().cloned().collect()
    }

    /// Registered nodes no other registered node depends on
    pub fn terminal_nodes(&self) -> Vec<Node> {
        let nodes = self.nodes.read();

        let consumed: HashSet<&str> = nodes
            .values()
            .flat_map(|node| {
                node.dependencies()
                    .iter()
                    .map(|d| d.target.name())
                    .filter(move |dep| *dep != node.name())
            })
            .collect();

        nodes
            .values()
            .filter(|node| !consumed.contains(node.name()))
            .cloned()
            .collect()
    }

    /// Build the validated closure of the named targets
    pub fn graph(&self, targets: &[&str]) -> Result<DependencyGraph> {
        let targets = targets
            .iter()
            .map(|name| self.node(name))
            .collect::<Result<Vec<_>>>()?;
        DependencyGraph::build(&targets, self)
    }

    /// Build the union closure of every terminal node.
    ///
    /// Fails if any registered node lies on a cycle, including cycles no terminal reaches.
    pub fn terminal_graph(&self) -> Result<DependencyGraph> {
        let graph = DependencyGraph::build(&self.terminal_nodes(), self)?;

        // Nodes outside every terminal closure are only consumed from within a cycle
        let stranded: Vec<Node> = self
            .nodes()
            .into_iter()
            .filter(|node| !graph.contains(node))
            .collect();
        if !stranded.is_empty() {
            DependencyGraph::build(&stranded, self)?;
        }

        Ok(graph)
    }

    /// Names of the target's closure in execution order
    pub fn topological_order(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.graph(&[name])?.order_names())
    }

    /// Node name to dependency names for the target's closure
    pub fn graph_dict(&self, name: &str) -> Result<IndexMap<String, Vec<String>>> {
        Ok(self.graph(&[name])?.graph_dict())
    }

    /// `graph_dict` over the whole registry (all terminal closures)
    pub fn full_graph_dict(&self) -> Result<IndexMap<String, Vec<String>>> {
        Ok(self.terminal_graph()?.graph_dict())
    }

    pub fn execute_one(&self, name: &str, inputs: NodeInputs) -> Result<Value> {
        self.execute_one_with(name, inputs, self.default_options())
    }

    pub fn execute_one_with(&self, name: &str, inputs: NodeInputs, options: RunOptions) -> Result<Value> {
        let graph = self.graph(&[name])?;
        let outputs = executor::execute(&graph, inputs, options)?;
        executor::single_output(outputs, name)
    }

    /// Run every terminal node under one shared context
    pub fn execute_all(&self, inputs: NodeInputs) -> Result<Outputs> {
        self.execute_all_with(inputs, self.default_options())
    }

    pub fn execute_all_with(&self, inputs: NodeInputs, options: RunOptions) -> Result<Outputs> {
        let graph = self.terminal_graph()?;
        executor::execute(&graph, inputs, options)
    }

    pub async fn execute_one_concurrent(&self, name: &str, inputs: NodeInputs) -> Result<Value> {
        self.execute_one_concurrent_with(name, inputs, self.default_options())
            .await
    }

    pub async fn execute_one_concurrent_with(
        &self,
        name: &str,
        inputs: NodeInputs,
        options: RunOptions,
    ) -> Result<Value> {
        let graph = self.graph(&[name])?;
        let outputs = executor::execute_concurrent(&graph, inputs, options).await?;
        executor::single_output(outputs, name)
    }

    pub async fn execute_all_concurrent(&self, inputs: NodeInputs) -> Result<Outputs> {
        self.execute_all_concurrent_with(inputs, self.default_options())
            .await
    }

    pub async fn execute_all_concurrent_with(
        &self,
        inputs: NodeInputs,
        options: RunOptions,
    ) -> Result<Outputs> {
        let graph = self.terminal_graph()?;
        executor::execute_concurrent(&graph, inputs, options).await
    }

    /// Run one target off the calling task
    pub async fn execute_one_on_worker(&self, name: &str, inputs: NodeInputs) -> Result<Value> {
        let graph = self.graph(&[name])?;
        let outputs = executor::execute_on_worker(graph, inputs, self.default_options()).await?;
        executor::single_output(outputs, name)
    }

    /// Drop the cached results of every registered node
    pub fn clear_caches(&self) {
        for node in self.nodes.read().values() {
            node.clear_cache();
        }
    }
}

impl NodeResolver for Registry {
    fn resolve(&self, name: &str) -> Option<Node> {
        self.get(name)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("nodes", &self.names())
            .finish()
    }
}
