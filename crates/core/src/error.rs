//! Error types for graph construction and execution.

use crate::types::ValueKind;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, DagError>;

/// Errors raised while building or running a dependency graph.
///
/// Structural errors (`Cycle`, `DuplicateName`, `UnresolvedDependency`) surface before any node
/// runs. Execution errors abort the remainder of the run that produced them.
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    /// The dependency closure contains a loop. `path` lists each looping node once, in order.
    #[error("Cycle detected: {}", render_cycle(path))]
    Cycle { path: Vec<String> },

    /// Two different nodes claim the same name.
    #[error("Duplicate node name '{name}': another node is already registered under it")]
    DuplicateName { name: String },

    /// A declared parameter has neither a dependency binding, a run input nor a default.
    #[error("Node '{node}' is missing required input '{parameter}'")]
    MissingInput { node: String, parameter: String },

    /// A bound value (or the output, as parameter `return`) does not match its declared kind.
    #[error("Node '{node}': '{parameter}' expected {expected}, got {actual}")]
    Validation {
        node: String,
        parameter: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    /// The node's computation failed.
    #[error("Node '{node}' failed: {source:#}")]
    NodeExecution {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    /// Registry lookup failed.
    #[error("Node '{name}' is not registered in '{registry}'")]
    UnknownNode { registry: String, name: String },

    /// A dependency referenced by name could not be resolved.
    #[error("Node '{node}' depends on '{dependency}', which cannot be resolved")]
    UnresolvedDependency { node: String, dependency: String },

    /// Two bindings of one node share a label.
    #[error("Node '{node}' binds '{binding}' more than once")]
    BindingConflict { node: String, binding: String },

    /// A blocking run reached a node with an async body.
    #[error("Node '{node}' is async and cannot run sequentially (required by '{target}')")]
    AsyncNodeInSequentialRun { target: String, node: String },

    /// A worker running an offloaded execution died.
    #[error("Worker failed: {0}")]
    Worker(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DagError {
    /// Name of the node the error is attributed to, if any
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::MissingInput { node, .. }
            | Self::Validation { node, .. }
            | Self::NodeExecution { node, .. }
            | Self::UnresolvedDependency { node, .. }
            | Self::BindingConflict { node, .. }
            | Self::AsyncNodeInSequentialRun { node, .. } => Some(node),
            Self::DuplicateName { name } | Self::UnknownNode { name, .. } => Some(name),
            Self::Cycle { path } => path.first().map(String::as_str),
            Self::Worker(_) | Self::Config(_) => None,
        }
    }

    /// Whether the error was raised before any node ran
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Cycle { .. }
                | Self::DuplicateName { .. }
                | Self::UnknownNode { .. }
                | Self::UnresolvedDependency { .. }
                | Self::BindingConflict { .. }
                | Self::AsyncNodeInSequentialRun { .. }
        )
    }
}

fn render_cycle(path: &[String]) -> String {
    match path.first() {
        Some(first) => format!("{} -> {}", path.join(" -> "), first),
        None => String::from("<empty>"),
    }
}
