use crate::approval::TimeoutAction;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Orchestrator configuration, usually loaded from `kiln.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub execution: ExecutionSettings,

    #[serde(default)]
    pub approval: ApprovalSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Per-level concurrency when a submission does not set one
    #[serde(default)]
    pub default_parallelism: Option<usize>,

    #[serde(default)]
    pub enable_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,

    #[serde(default = "default_timeout_check_interval_ms")]
    pub timeout_check_interval_ms: u64,

    #[serde(default)]
    pub timeout_action: TimeoutAction,

    #[serde(default = "default_system_actor")]
    pub system_actor: String,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_max_poll_attempts() -> u32 {
    720
}

fn default_timeout_check_interval_ms() -> u64 {
    60_000
}

fn default_system_actor() -> String {
    "system".to_string()
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_attempts: default_max_poll_attempts(),
            timeout_check_interval_ms: default_timeout_check_interval_ms(),
            timeout_action: TimeoutAction::default(),
            system_actor: default_system_actor(),
        }
    }
}

impl ApprovalSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_check_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// redb file for approval records; in-memory when unset
    #[serde(default)]
    pub approval_db: Option<String>,
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Configuration file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).context("Failed to read configuration file")?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration file")
    }
}
