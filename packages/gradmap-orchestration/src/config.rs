//! Engine configuration (YAML)
//!
//! Every field has a default, so an empty document is a valid config:
//!
//! ```yaml
//! input_root: /srv/gradmap/input
//! gradient_root: /srv/gradmap/gradients
//! output_root: /srv/gradmap/output
//! parallelism: 6
//! max_active_jobs: 2
//! ```

use crate::error::{OrchestratorError, Result};
use crate::job::JobId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_parallelism() -> usize {
    std::cmp::max(1, num_cpus::get() * 3 / 4) // 75% of cores
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Sandbox root for task inputs
    pub input_root: PathBuf,
    /// Sandbox root for gradient references
    pub gradient_root: PathBuf,
    /// Directory outputs are written to (created on demand)
    pub output_root: PathBuf,
    /// Worker threads per batch
    pub parallelism: usize,
    /// Jobs allowed in `processing` at once; the rest wait in `queued`
    pub max_active_jobs: usize,
    /// Prefix for download references handed to subscribers
    pub download_base: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            input_root: PathBuf::from("input"),
            gradient_root: PathBuf::from("gradients"),
            output_root: PathBuf::from("output"),
            parallelism: default_parallelism(),
            max_active_jobs: 4,
            download_base: "/api/jobs".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        // An empty document deserializes as unit, not as an empty map
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(OrchestratorError::config("parallelism must be at least 1"));
        }
        if self.max_active_jobs == 0 {
            return Err(OrchestratorError::config(
                "max_active_jobs must be at least 1",
            ));
        }
        if self.download_base.trim().is_empty() {
            return Err(OrchestratorError::config("download_base must not be empty"));
        }
        Ok(())
    }

    pub fn with_roots(
        mut self,
        input_root: impl Into<PathBuf>,
        gradient_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        self.input_root = input_root.into();
        self.gradient_root = gradient_root.into();
        self.output_root = output_root.into();
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_max_active_jobs(mut self, max_active_jobs: usize) -> Self {
        self.max_active_jobs = max_active_jobs;
        self
    }

    /// Where a finished job's archive is fetched from
    pub fn download_ref(&self, job_id: JobId) -> String {
        format!("{}/{}/download", self.download_base.trim_end_matches('/'), job_id)
    }
}
