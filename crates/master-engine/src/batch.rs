//! The contract between the master and a batch-execution backend.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;

/// Identifier a batch system assigns to one issued job.
pub type JobId = u64;

/// A cluster batch-execution backend.
///
/// The master depends only on this capability set. [`LocalBatchSystem`] is
/// the in-tree implementation; cluster adapters (Mesos, LSF, GridEngine,
/// Parasol) plug in behind the same trait.
///
/// Guarantees the master relies on: completions are delivered at least once
/// per id, and after [`kill_jobs`] an id either surfaces through
/// [`wait_updated_job`] with a nonzero code or has already been finished by
/// the caller.
///
/// [`LocalBatchSystem`]: crate::local::LocalBatchSystem
/// [`kill_jobs`]: Self::kill_jobs
/// [`wait_updated_job`]: Self::wait_updated_job
#[async_trait]
pub trait BatchSystem: Send {
    /// Submit a command for execution and return its id.
    ///
    /// `argv[0]` is the program, the rest its arguments; resource hints are
    /// advisory. Must not block waiting for capacity — queueing is the
    /// backend's job.
    async fn issue_job(&mut self, argv: Vec<String>, memory: u64, cpu: u32)
    -> anyhow::Result<JobId>;

    /// Best-effort termination. Resolves once none of `ids` counts as
    /// running.
    async fn kill_jobs(&mut self, ids: &[JobId]) -> anyhow::Result<()>;

    /// Every id submitted and not yet reaped through
    /// [`wait_updated_job`](Self::wait_updated_job).
    async fn issued_job_ids(&mut self) -> anyhow::Result<HashSet<JobId>>;

    /// Ids currently executing, with elapsed wall-clock seconds.
    async fn running_job_ids(&mut self) -> anyhow::Result<HashMap<JobId, f64>>;

    /// Wait up to `timeout` for one completion; `None` on timeout.
    ///
    /// Exit code 0 is success, anything else failure.
    async fn wait_updated_job(
        &mut self,
        timeout: Duration,
    ) -> anyhow::Result<Option<(JobId, i32)>>;
}
