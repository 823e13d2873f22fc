//! Topological scheduling over a validated [`DependencyGraph`].
//!
//! Both schedules use Kahn's algorithm: keep the count of unresolved dependencies per node, start
//! from the nodes with none, and release a dependent once its count reaches zero. Ties are broken
//! by declaration order so schedules are reproducible.

use crate::dag::DependencyGraph;
use crate::node::Node;
use crate::types::NodeId;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

fn in_degrees(graph: &DiGraph<Node, String>) -> Vec<usize> {
    graph
        .node_indices()
        .map(|n| graph.edges_directed(n, Direction::Incoming).count())
        .collect()
}

/// Release the dependents of `idx`, returning those whose in-degree dropped to zero
fn release(graph: &DiGraph<Node, String>, in_degree: &mut [usize], idx: NodeIndex) -> Vec<NodeIndex> {
    let mut ready = Vec::new();
    // One decrement per edge: a node bound twice to the same dependency has in-degree two.
    for edge in graph.edges_directed(idx, Direction::Outgoing) {
        let target = edge.target();
        in_degree[target.index()] -= 1;
        if in_degree[target.index()] == 0 {
            ready.push(target);
        }
    }
    ready
}

fn assert_complete(graph: &DiGraph<Node, String>, scheduled: usize) {
    assert_eq!(
        scheduled,
        graph.node_count(),
        "scheduler left {} node(s) with unresolved dependencies; a cycle escaped graph construction",
        graph.node_count() - scheduled
    );
}

/// One total order consistent with every dependency edge
pub fn topological_order(dag: &DependencyGraph) -> Vec<Node> {
    let graph = dag.inner();
    let mut in_degree = in_degrees(graph);

    let mut ready: BinaryHeap<Reverse<(NodeId, NodeIndex)>> = graph
        .node_indices()
        .filter(|n| in_degree[n.index()] == 0)
        .map(|n| Reverse((graph[n].id(), n)))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse((_, idx))) = ready.pop() {
        order.push(graph[idx].clone());
        for next in release(graph, &mut in_degree, idx) {
            ready.push(Reverse((graph[next].id(), next)));
        }
    }

    assert_complete(graph, order.len());
    order
}

/// Maximal sets of nodes whose dependencies are all satisfied by earlier layers
pub fn ready_layers(dag: &DependencyGraph) -> Vec<Vec<Node>> {
    let graph = dag.inner();
    let mut in_degree = in_degrees(graph);

    let mut current: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|n| in_degree[n.index()] == 0)
        .collect();

    let mut layers = Vec::new();
    let mut scheduled = 0;
    while !current.is_empty() {
        current.sort_by_key(|&n| graph[n].id());
        scheduled += current.len();

        let mut next = Vec::new();
        for &idx in &current {
            next.extend(release(graph, &mut in_degree, idx));
        }

        layers.push(current.iter().map(|&n| graph[n].clone()).collect());
        current = next;
    }

    assert_complete(graph, scheduled);
    layers
}
