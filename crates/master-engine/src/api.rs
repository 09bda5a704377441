//! Public types for the workflow master.

use std::path::PathBuf;
use std::time::Duration;

use arbor_master_core::config::WorkflowConfig;

use crate::batch::BatchSystem;

/// Runtime settings for [`run_master`].
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Workflow directory owning every job record and output file.
    pub job_tree: PathBuf,

    /// Worker executable issued for every job, invoked as
    /// `worker_path <job_tree> <job_file>` with a cleared environment.
    pub worker_path: PathBuf,

    /// How often to reconcile issued jobs against the batch system.
    pub rescue_jobs_frequency: Duration,

    /// Wall-clock budget after which a running job is killed.
    ///
    /// Values at or above [`MasterConfig::MAX_JOB_DURATION_DISABLED`] turn
    /// the over-long rescue off; smaller values are clamped up to ten times
    /// `ideal_job_time` so a tight budget cannot shoot down healthy jobs.
    pub max_job_duration: Duration,

    /// Expected per-job runtime, the floor for `max_job_duration`.
    pub ideal_job_time: Duration,

    /// Whether to collate worker stat fragments into `stats.xml`.
    pub stats: bool,

    /// Bounded wait for one completion per loop iteration.
    pub poll_timeout: Duration,

    /// Consecutive rescue misses after which a job is declared lost.
    pub missing_job_threshold: u32,
}

impl MasterConfig {
    /// Default bounded wait for one completion.
    pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default number of consecutive misses before a job counts as lost.
    ///
    /// A freshly issued job can be invisible to the backend for a short
    /// window; three misses across rescue passes means it is really gone.
    pub const DEFAULT_MISSING_THRESHOLD: u32 = 3;

    /// Durations at or above this disable the over-long rescue entirely.
    pub const MAX_JOB_DURATION_DISABLED: Duration = Duration::from_secs(10_000_000);

    /// How much sooner the next rescue runs while jobs are still missing.
    pub const RESCUE_RETRY_ADVANCE: Duration = Duration::from_secs(60);

    /// Build the runtime settings from a workflow's persisted configuration.
    pub fn from_workflow(config: &WorkflowConfig) -> Self {
        Self {
            job_tree: config.job_tree.clone(),
            worker_path: config.worker_path.clone(),
            rescue_jobs_frequency: Duration::from_secs_f64(config.rescue_jobs_frequency.max(0.0)),
            max_job_duration: Duration::from_secs_f64(config.max_job_duration.max(0.0)),
            ideal_job_time: Duration::from_secs_f64(config.job_time.max(0.0)),
            stats: config.stats_enabled(),
            poll_timeout: Self::DEFAULT_POLL_TIMEOUT,
            missing_job_threshold: Self::DEFAULT_MISSING_THRESHOLD,
        }
    }
}

/// Drive the workflow to completion.
///
/// Issues ready jobs, reacts to completions, retries failures within each
/// job's budget, and rescues jobs the backend lost or let run too long.
/// Returns the number of permanently failed jobs, 0 on complete success.
///
/// The batch system must report no issued jobs at entry: a previous run's
/// leftovers are expected to have been killed by the invoking script, and
/// anything still visible is treated as state corruption.
pub async fn run_master(config: MasterConfig, batch: Box<dyn BatchSystem>) -> anyhow::Result<u64> {
    crate::engine::run(config, batch).await
}
