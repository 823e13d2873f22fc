use crate::error::{DagError, Result};
use crate::node::NodeOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine configuration, usually read from `knot.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSection {
    /// Cache setting for nodes declared through a registry
    #[serde(default = "default_true")]
    pub cache_by_default: bool,

    /// Validation setting for nodes declared through a registry
    #[serde(default = "default_true")]
    pub validate_by_default: bool,

    /// Call-time cache switch used when a run does not pass its own options
    #[serde(default = "default_true")]
    pub enable_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_true() -> bool {
    true
}

fn default_filter() -> String {
    "knot=info".to_string()
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            cache_by_default: true,
            validate_by_default: true,
            enable_cache: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

impl EngineConfig {
    /// Load a configuration file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            DagError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| DagError::Config(format!("failed to parse configuration: {}", e)))
    }

    /// Options applied to nodes declared through a configured registry
    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            cache: self.engine.cache_by_default,
            validate_types: self.engine.validate_by_default,
        }
    }
}
