// Core engine for Knot: declare computation nodes, wire them into a DAG and execute it

pub mod cache;
pub mod config;
pub mod context;
pub mod dag;
pub mod error;
pub mod executor;
pub mod node;
pub mod registry;
pub mod scheduler;
pub mod types;
pub mod validation;

pub use cache::{CacheKey, CacheStats};
pub use config::{EngineConfig, EngineSection, LoggingConfig};
pub use context::{ExecutionContext, RunOptions};
pub use dag::{DependencyGraph, Detached, NodeResolver};
pub use error::{DagError, Result};
pub use executor::Outputs;
pub use node::{Compute, Dependency, DependencyRef, Node, NodeBuilder, NodeOptions, Param};
pub use registry::{Registry, DEFAULT_REGISTRY};
pub use types::*;
