use crate::error::{DagError, Result};
use crate::node::{DependencyRef, Node};
use crate::scheduler;
use crate::types::NodeId;
use indexmap::IndexMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// Looks up nodes referenced by name
pub trait NodeResolver {
    fn resolve(&self, name: &str) -> Option<Node>;
}

/// Resolver for graphs built without a registry: nothing resolves by name
#[derive(Debug, Clone, Copy, Default)]
pub struct Detached;

impl NodeResolver for Detached {
    fn resolve(&self, _name: &str) -> Option<Node> {
        None
    }
}

/// Validated dependency closure of one or more target nodes.
///
/// Edges run from a dependency to its consumer and carry the binding label the consumer
/// receives the dependency's result under.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<Node, String>,
    indices: HashMap<NodeId, NodeIndex>,
    targets: Vec<NodeIndex>,
}

impl DependencyGraph {
    /// Build the closure of `targets`, rejecting cycles and conflicting names
    pub fn build(targets: &[Node], resolver: &dyn NodeResolver) -> Result<Self> {
        let mut builder = ClosureBuilder::new(resolver);
        let mut target_indices = Vec::with_capacity(targets.len());

        for target in targets {
            let idx = builder.visit(target)?;
            if !target_indices.contains(&idx) {
                target_indices.push(idx);
            }
        }

        Ok(Self {
            graph: builder.graph,
            indices: builder.indices,
            targets: target_indices,
        })
    }

    pub(crate) fn inner(&self) -> &DiGraph<Node, String> {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.indices.contains_key(&node.id())
    }

    /// Requested targets, in request order
    pub fn targets(&self) -> Vec<Node> {
        self.targets.iter().map(|&idx| self.graph[idx].clone()).collect()
    }

    /// Every node of the closure, in discovery order
    pub fn nodes(&self) -> Vec<Node> {
        self.graph.node_weights().cloned().collect()
    }

    /// Resolved dependencies of a node with their binding labels
    pub fn bindings(&self, node: &Node) -> Vec<(String, Node)> {
        let Some(&idx) = self.indices.get(&node.id()) else {
            return Vec::new();
        };

        self.graph
            .edges_directed(idx, Direction::Incoming)
            .map(|edge| (edge.weight().clone(), self.graph[edge.source()].clone()))
            .collect()
    }

    /// Nodes of the closure consuming the given node
    pub fn dependents(&self, node: &Node) -> Vec<Node> {
        let Some(&idx) = self.indices.get(&node.id()) else {
            return Vec::new();
        };

        let mut dependents: Vec<Node> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect();
        dependents.sort_by_key(Node::id);
        dependents.dedup();
        dependents
    }

    /// Nodes with no dependencies (can start immediately)
    pub fn entry_nodes(&self) -> Vec<Node> {
        let mut entries: Vec<Node> = self
            .graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| self.graph[n].clone())
            .collect();
        entries.sort_by_key(Node::id);
        entries
    }

    /// First async node of the closure in declaration order, if any
    pub fn first_async(&self) -> Option<Node> {
        self.graph
            .node_weights()
            .filter(|n| n.is_async())
            .min_by_key(|n| n.id())
            .cloned()
    }

    pub fn has_async(&self) -> bool {
        self.graph.node_weights().any(Node::is_async)
    }

    /// Nodes in a dependency-respecting order (Kahn's algorithm)
    pub fn topological_order(&self) -> Vec<Node> {
        scheduler::topological_order(self)
    }

    /// Layers of mutually independent nodes, each depending only on earlier layers
    pub fn ready_layers(&self) -> Vec<Vec<Node>> {
        scheduler::ready_layers(self)
    }

    /// Node names in topological order
    pub fn order_names(&self) -> Vec<String> {
        self.topological_order()
            .iter()
            .map(|n| n.name().to_string())
            .collect()
    }

    /// Node name to the names of its dependencies, in topological order
    pub fn graph_dict(&self) -> IndexMap<String, Vec<String>> {
        self.topological_order()
            .iter()
            .map(|node| {
                let deps = node
                    .dependencies()
                    .iter()
                    .map(|d| d.target.name().to_string())
                    .collect();
                (node.name().to_string(), deps)
            })
            .collect()
    }
}

/// Depth-first closure discovery.
///
/// `visiting` holds the nodes on the current path and `indices` the fully resolved ones; meeting
/// a visiting node again closes a cycle.
struct ClosureBuilder<'a> {
    resolver: &'a dyn NodeResolver,
    graph: DiGraph<Node, String>,
    indices: HashMap<NodeId, NodeIndex>,
    names: HashMap<String, NodeId>,
    visiting: HashSet<NodeId>,
    path: Vec<Node>,
}

impl<'a> ClosureBuilder<'a> {
    fn new(resolver: &'a dyn NodeResolver) -> Self {
        Self {
            resolver,
            graph: DiGraph::new(),
            indices: HashMap::new(),
            names: HashMap::new(),
            visiting: HashSet::new(),
            path: Vec::new(),
        }
    }

    fn visit(&mut self, node: &Node) -> Result<NodeIndex> {
        let id = node.id();
        if let Some(&idx) = self.indices.get(&id) {
            return Ok(idx);
        }

        if self.visiting.contains(&id) {
            let start = self.path.iter().position(|n| n.id() == id).unwrap_or(0);
            let path = self.path[start..]
                .iter()
                .map(|n| n.name().to_string())
                .collect();
            return Err(DagError::Cycle { path });
        }

        match self.names.get(node.name()) {
            Some(&other) if other != id => {
                return Err(DagError::DuplicateName {
                    name: node.name().to_string(),
                })
            }
            Some(_) => {}
            None => {
                self.names.insert(node.name().to_string(), id);
            }
        }

        self.visiting.insert(id);
        self.path.push(node.clone());

        let mut edges = Vec::with_capacity(node.dependencies().len());
        for dep in node.dependencies() {
            let target = match &dep.target {
                DependencyRef::Node(target) => target.clone(),
                DependencyRef::Named(name) => {
                    self.resolver
                        .resolve(name)
                        .ok_or_else(|| DagError::UnresolvedDependency {
                            node: node.name().to_string(),
                            dependency: name.clone(),
                        })?
                }
            };
            let dep_idx = self.visit(&target)?;
            edges.push((dep_idx, dep.binding.clone()));
        }

        self.path.pop();
        self.visiting.remove(&id);

        let idx = self.graph.add_node(node.clone());
        self.indices.insert(id, idx);
        for (dep_idx, binding) in edges {
            // Edge from dependency to dependent (dep -> node)
            self.graph.add_edge(dep_idx, idx, binding);
        }

        Ok(idx)
    }
}
