//! Configuration file handling for provisioning runs.
//!
//! A provisioning config bundles where to read feature packs from, where to
//! install, and the request itself, so a run can be repeated from one file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::request::ProvisioningRequest;

fn default_encoding() -> String {
    "UTF-8".to_string()
}

fn default_max_parallel_fetches() -> usize {
    4
}

/// Provisioning configuration that can be saved/loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProvisioningConfig {
    /// Root of the local artifact repository
    pub repository: PathBuf,
    /// Installation directory, must be absent or empty
    pub target_dir: PathBuf,
    /// Scratch space for plugins, a temporary directory when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_max_parallel_fetches")]
    pub max_parallel_fetches: usize,
    pub request: ProvisioningRequest,
}

impl ProvisioningConfig {
    pub fn new(repository: impl Into<PathBuf>, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            target_dir: target_dir.into(),
            work_dir: None,
            encoding: default_encoding(),
            max_parallel_fetches: default_max_parallel_fetches(),
            request: ProvisioningRequest::default(),
        }
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.repository.as_os_str().is_empty() {
            anyhow::bail!("Repository path must be specified");
        }
        if self.target_dir.as_os_str().is_empty() {
            anyhow::bail!("Target directory must be specified");
        }
        if self.target_dir == self.repository {
            anyhow::bail!("Target directory cannot be the repository itself");
        }
        if self.encoding.trim().is_empty() {
            anyhow::bail!("Encoding must not be empty");
        }
        if self.max_parallel_fetches == 0 {
            anyhow::bail!("Max parallel fetches must be at least 1");
        }
        if self.request.feature_packs.is_empty() {
            anyhow::bail!("Request must select at least one feature pack");
        }
        Ok(())
    }
}
