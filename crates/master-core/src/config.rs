//! Workflow configuration (`config.xml`).

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::layout;

/// Settings persisted as attributes of a workflow's `config.xml`.
///
/// All durations are seconds. `stats` is a presence flag: any value enables
/// stat-fragment aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename = "config")]
pub struct WorkflowConfig {
    /// Absolute path of the workflow directory itself.
    #[serde(rename = "@job_tree")]
    pub job_tree: PathBuf,

    /// Worker executable invoked for every issued job.
    #[serde(rename = "@worker_path")]
    pub worker_path: PathBuf,

    /// How often issued jobs are reconciled against the batch system.
    #[serde(rename = "@rescue_jobs_frequency", default = "default_rescue_jobs_frequency")]
    pub rescue_jobs_frequency: f64,

    /// Wall-clock budget after which a running job is killed.
    #[serde(rename = "@max_job_duration", default = "default_max_job_duration")]
    pub max_job_duration: f64,

    /// Expected per-job runtime; the floor for `max_job_duration`.
    #[serde(rename = "@job_time", default = "default_job_time")]
    pub job_time: f64,

    /// Present (any value) when stats aggregation is enabled.
    #[serde(rename = "@stats", default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<String>,
}

fn default_rescue_jobs_frequency() -> f64 {
    3600.0
}

fn default_max_job_duration() -> f64 {
    // High enough to disable the over-long rescue.
    10_000_000.0
}

fn default_job_time() -> f64 {
    30.0
}

impl WorkflowConfig {
    /// A configuration with default timings and stats disabled.
    pub fn new(job_tree: impl Into<PathBuf>, worker_path: impl Into<PathBuf>) -> Self {
        Self {
            job_tree: job_tree.into(),
            worker_path: worker_path.into(),
            rescue_jobs_frequency: default_rescue_jobs_frequency(),
            max_job_duration: default_max_job_duration(),
            job_time: default_job_time(),
            stats: None,
        }
    }

    /// Whether stat-fragment aggregation is enabled.
    pub fn stats_enabled(&self) -> bool {
        self.stats.is_some()
    }

    /// Read the configuration stored in `job_tree`.
    pub fn load(job_tree: &Path) -> anyhow::Result<Self> {
        let path = layout::config_file(job_tree);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read workflow config {}", path.display()))?;
        let config = quick_xml::de::from_str(&raw)
            .with_context(|| format!("parse workflow config {}", path.display()))?;
        Ok(config)
    }

    /// Write the configuration into its workflow directory.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = layout::config_file(&self.job_tree);
        let dir = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("invalid config path: {}", path.display()))?;
        std::fs::create_dir_all(dir)?;

        let xml = quick_xml::se::to_string(self)?;
        let tmp = path.with_extension("xml.tmp");
        std::fs::write(&tmp, xml)?;
        std::fs::rename(tmp, path)?;
        Ok(())
    }
}
