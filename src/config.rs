//! Pipeline configuration.
//!
//! The build graph and the orchestrator's tunables are declared in one TOML
//! file:
//!
//! ```toml
//! [status]
//! context = "changeset-gate"
//!
//! [wait]
//! poll_interval_secs = 15
//! timeout_mins = 45
//!
//! [execution]
//! max_concurrency = 4
//! mid_run_modification = "suppress_publish"
//!
//! [[node]]
//! name = "core"
//! repository = "acme/core"
//! job = "ci.yml"
//!
//! [[node]]
//! name = "app"
//! repository = "acme/app"
//! job = "ci.yml"
//! depends_on = ["core"]
//! ```
//!
//! Every table is optional except the nodes. The graph is validated when the
//! file is loaded, so a cycle or a dangling dependency is a startup error.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::dag::{BuildGraph, GraphError};
use crate::gate::{MidRunPolicy, StatusSettings};
use crate::trigger::{OutOfRange, WaitConfig, WaitSettings};
use crate::types::BuildNode;

/// Errors from loading the pipeline file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid pipeline file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid build graph: {0}")]
    Graph(#[from] GraphError),

    #[error("invalid [wait] setting: {0}")]
    Wait(#[from] OutOfRange),

    #[error("pipeline declares no build nodes")]
    NoNodes,
}

/// The `[execution]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionSettings {
    /// Upper bound on nodes in flight at once. Unbounded if absent.
    pub max_concurrency: Option<NonZeroUsize>,
    /// What a modification does to a run already in flight.
    pub mid_run_modification: MidRunPolicy,
}

/// A parsed and validated pipeline file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(rename = "node", default)]
    pub nodes: Vec<BuildNode>,
    #[serde(default)]
    pub status: StatusSettings,
    #[serde(default)]
    pub wait: WaitSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
}

impl PipelineConfig {
    /// Reads and validates the pipeline file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parses and validates a pipeline document.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(text)?;
        if config.nodes.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        config.wait.validate()?;
        config.graph()?;
        Ok(config)
    }

    /// Builds the dependency graph of the declared nodes.
    pub fn graph(&self) -> Result<BuildGraph, GraphError> {
        BuildGraph::new(self.nodes.clone())
    }

    /// Wait settings from the file, with environment overrides applied on top.
    pub fn wait_config(&self) -> WaitConfig {
        WaitConfig::from(&self.wait).with_env_overrides()
    }
}
