use anyhow::{Context, Result};
use kiln_core::JobConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Pipeline definition file: a name and its jobs, in JSON or TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineFile {
    pub name: String,
    pub jobs: Vec<JobConfig>,
}

impl PipelineFile {
    /// Load a pipeline, choosing the format by file extension (`.toml`, otherwise JSON)
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file {}", path.display()))?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        if is_toml {
            toml::from_str(&content).context("Failed to parse TOML pipeline")
        } else {
            serde_json::from_str(&content).context("Failed to parse JSON pipeline")
        }
    }
}
