use crate::config::EngineConfig;
use crate::dag::DependencyGraph;
use crate::error::{DagError, Result};
use crate::node::Node;
use crate::types::{NodeId, NodeInputs, RunId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Call-time options for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// When false, node caches are neither read nor written for this run
    pub enable_cache: bool,
}

impl RunOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            enable_cache: config.engine.enable_cache,
        }
    }

    pub fn without_cache() -> Self {
        Self {
            enable_cache: false,
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { enable_cache: true }
    }
}

/// State of one run: caller inputs and the results computed so far.
///
/// Shared by every target of the run, so a common dependency computes once.
#[derive(Debug)]
pub struct ExecutionContext {
    run_id: RunId,
    inputs: NodeInputs,
    results: HashMap<NodeId, Value>,
    options: RunOptions,
}

impl ExecutionContext {
    pub fn new(inputs: NodeInputs, options: RunOptions) -> Self {
        Self {
            run_id: RunId::new(),
            inputs,
            results: HashMap::new(),
            options,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn inputs(&self) -> &NodeInputs {
        &self.inputs
    }

    pub fn options(&self) -> RunOptions {
        self.options
    }

    pub fn result(&self, node: &Node) -> Option<&Value> {
        self.results.get(&node.id())
    }

    pub fn completed(&self) -> usize {
        self.results.len()
    }

    /// Store a node's result. Each node is recorded at most once per run.
    pub(crate) fn record(&mut self, node: &Node, value: Value) {
        let previous = self.results.insert(node.id(), value);
        debug_assert!(
            previous.is_none(),
            "node '{}' recorded twice in run {}",
            node.name(),
            self.run_id
        );
    }

    /// Bind a node's inputs: dependency results first, then run inputs, then declared defaults.
    ///
    /// Run inputs that are not declared parameters of the node are not passed on.
    pub(crate) fn resolve_inputs(&self, graph: &DependencyGraph, node: &Node) -> Result<NodeInputs> {
        let mut resolved = NodeInputs::new();

        for (binding, dep) in graph.bindings(node) {
            let value = self
                .results
                .get(&dep.id())
                .ok_or_else(|| DagError::MissingInput {
                    node: node.name().to_string(),
                    parameter: binding.clone(),
                })?;
            resolved.insert(binding, value.clone());
        }

        for param in node.params() {
            let value = self
                .inputs
                .get(&param.name)
                .or(param.default.as_ref())
                .ok_or_else(|| DagError::MissingInput {
                    node: node.name().to_string(),
                    parameter: param.name.clone(),
                })?;
            resolved.insert(param.name.clone(), value.clone());
        }

        Ok(resolved)
    }
}
