//! Issuance bookkeeping and the rescue policies for jobs gone awry.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::bail;
use tracing::{debug, error, info};

use arbor_master_core::layout;
use arbor_master_core::store::{JobStore, TreeState};

use crate::api::MasterConfig;
use crate::batch::{BatchSystem, JobId};

/// Fatal inconsistencies between the master's bookkeeping and reality.
///
/// These indicate code or state-store corruption and abort the main loop.
#[derive(Debug, thiserror::Error)]
pub(crate) enum InvariantViolation {
    #[error("batch system reported running job {0} that was never issued")]
    UnknownBackendJob(JobId),
    #[error("job id {0} is not in the issued-job table")]
    UnknownJobId(JobId),
    #[error("job {0} has neither children nor follow-on commands")]
    JobWithoutWork(String),
    #[error("job {0} already has issued children")]
    ChildrenAlreadyIssued(String),
    #[error("batch system reports {0} issued job(s) at startup, expected none")]
    StaleBackendJobs(usize),
}

/// Issues worker commands to the batch system and tracks them to completion.
///
/// Owns the issued-job table (backend id to job record id) and the
/// missing-count table used by the lost-job rescue.
pub(crate) struct JobBatcher {
    job_tree: PathBuf,
    worker_path: PathBuf,
    issued: HashMap<JobId, String>,
    jobs_issued: usize,
    missing_counts: HashMap<JobId, u32>,
}

impl JobBatcher {
    pub(crate) fn new(job_tree: PathBuf, worker_path: PathBuf) -> Self {
        Self {
            job_tree,
            worker_path,
            issued: HashMap::new(),
            jobs_issued: 0,
            missing_counts: HashMap::new(),
        }
    }

    /// Jobs issued and not yet removed through [`Self::remove_job_id`].
    pub(crate) fn jobs_issued(&self) -> usize {
        self.jobs_issued
    }

    pub(crate) fn has_job(&self, id: JobId) -> bool {
        self.issued.contains_key(&id)
    }

    pub(crate) fn job(&self, id: JobId) -> Option<&str> {
        self.issued.get(&id).map(String::as_str)
    }

    fn worker_argv(&self, job_store_id: &str) -> Vec<String> {
        vec![
            self.worker_path.display().to_string(),
            self.job_tree.display().to_string(),
            layout::job_file(&self.job_tree, job_store_id).display().to_string(),
        ]
    }

    /// Submit the worker command for one job. Backend rejection is fatal.
    pub(crate) async fn issue_job(
        &mut self,
        batch: &mut dyn BatchSystem,
        job_store_id: &str,
        memory: u64,
        cpu: u32,
    ) -> anyhow::Result<()> {
        self.jobs_issued += 1;
        let id = batch
            .issue_job(self.worker_argv(job_store_id), memory, cpu)
            .await?;
        self.issued.insert(id, job_store_id.to_string());
        debug!(job = %job_store_id, job_id = id, cpu, "issued job");
        Ok(())
    }

    /// Issue a list of jobs in order.
    pub(crate) async fn issue_jobs(
        &mut self,
        batch: &mut dyn BatchSystem,
        jobs: &[(String, u64, u32)],
    ) -> anyhow::Result<()> {
        for (job_store_id, memory, cpu) in jobs {
            self.issue_job(batch, job_store_id, *memory, *cpu).await?;
        }
        Ok(())
    }

    /// Pop an issued job; unknown ids fail loudly.
    pub(crate) fn remove_job_id(&mut self, id: JobId) -> anyhow::Result<String> {
        let Some(job_store_id) = self.issued.remove(&id) else {
            bail!(InvariantViolation::UnknownJobId(id));
        };
        self.jobs_issued -= 1;
        Ok(job_store_id)
    }

    /// Kill the given jobs and record each as finished with a failure.
    pub(crate) async fn kill_jobs(
        &mut self,
        batch: &mut dyn BatchSystem,
        store: &JobStore,
        state: &mut TreeState,
        ids: Vec<JobId>,
    ) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        batch.kill_jobs(&ids).await?;
        for id in ids {
            let job_store_id = self.remove_job_id(id)?;
            store.process_finished_job(state, &job_store_id, 1)?;
        }
        Ok(())
    }

    /// Kill every running job that has outlived the configured duration.
    pub(crate) async fn reissue_over_long_jobs(
        &mut self,
        batch: &mut dyn BatchSystem,
        store: &JobStore,
        state: &mut TreeState,
        cfg: &MasterConfig,
    ) -> anyhow::Result<()> {
        let ideal = cfg.ideal_job_time;
        let mut max_duration = cfg.max_job_duration;
        if max_duration < ideal * 10 {
            max_duration = ideal * 10;
            info!(
                max_job_duration = max_duration.as_secs_f64(),
                "max job duration is under ten times the ideal job time, raising it"
            );
        }
        if max_duration >= MasterConfig::MAX_JOB_DURATION_DISABLED {
            return Ok(());
        }

        let max_secs = max_duration.as_secs_f64();
        let mut to_kill = Vec::new();
        for (id, elapsed) in batch.running_job_ids().await? {
            if elapsed > max_secs {
                error!(
                    job = self.job(id).unwrap_or("<unknown>"),
                    job_id = id,
                    elapsed,
                    max_job_duration = max_secs,
                    "job exceeded the max duration, killing it"
                );
                to_kill.push(id);
            }
        }
        self.kill_jobs(batch, store, state, to_kill).await
    }

    /// Reconcile the issued-job table against the backend's view.
    ///
    /// An id the backend fails to report accumulates one miss per pass; a
    /// freshly issued job can legitimately be invisible for a short window,
    /// so only `threshold` consecutive misses count as lost. Returns whether
    /// the missing-count table ended up empty.
    pub(crate) async fn reissue_missing_jobs(
        &mut self,
        batch: &mut dyn BatchSystem,
        store: &JobStore,
        state: &mut TreeState,
        threshold: u32,
    ) -> anyhow::Result<bool> {
        let backend_issued = batch.issued_job_ids().await?;
        let own: HashSet<JobId> = self.issued.keys().copied().collect();

        // Entries whose id left the issued table were reaped normally.
        self.missing_counts.retain(|id, _| {
            let keep = own.contains(id);
            if !keep {
                debug!(job_id = *id, "job is no longer missing");
            }
            keep
        });

        for id in &backend_issued {
            if !own.contains(id) {
                bail!(InvariantViolation::UnknownBackendJob(*id));
            }
        }

        let mut to_kill = Vec::new();
        for id in own {
            if backend_issued.contains(&id) {
                self.missing_counts.remove(&id);
                continue;
            }
            let times_missing = {
                let count = self.missing_counts.entry(id).or_insert(0);
                *count += 1;
                *count
            };
            error!(
                job = self.job(id).unwrap_or("<unknown>"),
                job_id = id,
                times_missing,
                "issued job is missing from the batch system"
            );
            if times_missing >= threshold {
                self.missing_counts.remove(&id);
                to_kill.push(id);
            }
        }
        self.kill_jobs(batch, store, state, to_kill).await?;
        Ok(self.missing_counts.is_empty())
    }
}
