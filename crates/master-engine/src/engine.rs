//! The master scheduling loop.
//!
//! One logical thread of control owns the tree state and the batcher. Each
//! iteration drains scheduler updates first, then checks for termination,
//! then polls the batch system for a completion; rescues run off the poll
//! timeout. Draining before polling guarantees that a completion which made
//! a parent ready is acted on before any newer completion is observed.

use std::time::Instant;

use anyhow::bail;
use tracing::{debug, error, info};

use arbor_master_core::layout;
use arbor_master_core::store::{JobStore, TreeState};

use crate::api::MasterConfig;
use crate::batch::{BatchSystem, JobId};
use crate::batcher::{InvariantViolation, JobBatcher};
use crate::stats::StatsAggregator;

pub(crate) async fn run(cfg: MasterConfig, mut batch: Box<dyn BatchSystem>) -> anyhow::Result<u64> {
    info!(
        rescue_jobs_frequency = cfg.rescue_jobs_frequency.as_secs_f64(),
        max_job_duration = cfg.max_job_duration.as_secs_f64(),
        "starting master"
    );

    // The batch system must start clean; leftovers from a previous run are
    // the invoking script's problem, not ours to adopt.
    let stale = batch.issued_job_ids().await?;
    if !stale.is_empty() {
        bail!(InvariantViolation::StaleBackendJobs(stale.len()));
    }

    let store = JobStore::open(&cfg.job_tree)?;
    let state = store.load_tree_state()?;
    info!(
        ready = state.updated_jobs.len(),
        parents = state.child_counts.len(),
        "loaded job tree state"
    );

    let aggregator = if cfg.stats {
        let shards = layout::make_stats_shard_dirs(&cfg.job_tree)?;
        Some(StatsAggregator::spawn(cfg.job_tree.clone(), shards))
    } else {
        None
    };

    let batcher = JobBatcher::new(cfg.job_tree.clone(), cfg.worker_path.clone());
    let runtime = MasterRuntime {
        cfg,
        batch,
        store,
        state,
        batcher,
        total_failed_jobs: 0,
        last_rescue: Instant::now(),
    };
    let result = runtime.run().await;

    if let Some(aggregator) = aggregator {
        info!("waiting for the stats aggregator to drain");
        let wait_started = Instant::now();
        match aggregator.stop().await {
            Ok(summary) => info!(
                files = summary.files_processed,
                collating_secs = summary.elapsed.as_secs_f64(),
                waited_secs = wait_started.elapsed().as_secs_f64(),
                "stats finished collating"
            ),
            Err(err) => error!(error = %err, "stats aggregator failed"),
        }
    }
    result
}

struct MasterRuntime {
    cfg: MasterConfig,
    batch: Box<dyn BatchSystem>,
    store: JobStore,
    state: TreeState,
    batcher: JobBatcher,
    total_failed_jobs: u64,
    last_rescue: Instant,
}

impl MasterRuntime {
    async fn run(mut self) -> anyhow::Result<u64> {
        info!("starting the main loop");
        loop {
            self.drain_updated_jobs().await?;

            if self.batcher.jobs_issued() == 0 {
                info!(
                    failed = self.total_failed_jobs,
                    "only failed jobs and their dependents remain, exiting"
                );
                break;
            }

            match self.batch.wait_updated_job(self.cfg.poll_timeout).await? {
                Some((job_id, exit_code)) => self.handle_completion(job_id, exit_code)?,
                None => self.maybe_rescue().await?,
            }
        }
        Ok(self.total_failed_jobs)
    }

    /// Act on every job the tree marked as needing scheduler attention.
    async fn drain_updated_jobs(&mut self) -> anyhow::Result<()> {
        if self.state.updated_jobs.is_empty() {
            return Ok(());
        }
        debug!(
            updated = self.state.updated_jobs.len(),
            issued = self.batcher.jobs_issued(),
            "draining updated jobs"
        );

        let ids: Vec<String> = std::mem::take(&mut self.state.updated_jobs)
            .into_iter()
            .collect();
        for job_store_id in ids {
            let mut job = self.store.load(&job_store_id)?;

            if !job.messages.is_empty() {
                for message in &job.messages {
                    error!(job = %job_store_id, message = %message, "message from job");
                }
                job.messages.clear();
                self.store.save(&job)?;
            }

            if !job.children.is_empty() {
                let children = std::mem::take(&mut job.children);
                debug!(job = %job_store_id, children = children.len(), "scheduling children");
                if self.state.child_counts.contains_key(&job_store_id) {
                    bail!(InvariantViolation::ChildrenAlreadyIssued(job_store_id));
                }
                for child in &children {
                    self.state
                        .child_to_parent
                        .insert(child.job_store_id.clone(), job_store_id.clone());
                }
                self.state
                    .child_counts
                    .insert(job_store_id.clone(), children.len());
                let specs: Vec<(String, u64, u32)> = children
                    .into_iter()
                    .map(|child| (child.job_store_id, child.memory, child.cpu))
                    .collect();
                self.batcher.issue_jobs(self.batch.as_mut(), &specs).await?;
            } else {
                let Some(follow_on) = job.follow_on_commands.last() else {
                    bail!(InvariantViolation::JobWithoutWork(job_store_id));
                };
                if job.remaining_retry_count > 0 {
                    debug!(job = %job_store_id, "issuing follow-on command");
                    let (memory, cpu) = (follow_on.memory, follow_on.cpu);
                    self.batcher
                        .issue_job(self.batch.as_mut(), &job_store_id, memory, cpu)
                        .await?;
                } else {
                    self.total_failed_jobs += 1;
                    error!(job = %job_store_id, "job is completely failed");
                }
            }
        }
        Ok(())
    }

    fn handle_completion(&mut self, job_id: JobId, exit_code: i32) -> anyhow::Result<()> {
        if !self.batcher.has_job(job_id) {
            // The at-least-once duplicate case.
            error!(job_id, "a result seems to have already been processed");
            return Ok(());
        }
        if exit_code == 0 {
            debug!(
                job_id,
                job = self.batcher.job(job_id).unwrap_or("<unknown>"),
                "job ended successfully"
            );
        } else {
            error!(
                job_id,
                job = self.batcher.job(job_id).unwrap_or("<unknown>"),
                exit_code,
                "job failed"
            );
        }
        let job_store_id = self.batcher.remove_job_id(job_id)?;
        self.store
            .process_finished_job(&mut self.state, &job_store_id, exit_code)
    }

    /// Run the rescues once per `rescue_jobs_frequency` of quiet polling.
    async fn maybe_rescue(&mut self) -> anyhow::Result<()> {
        if self.last_rescue.elapsed() < self.cfg.rescue_jobs_frequency {
            return Ok(());
        }

        self.batcher
            .reissue_over_long_jobs(self.batch.as_mut(), &self.store, &mut self.state, &self.cfg)
            .await?;
        info!("reissued any over long jobs");

        let quiet = self
            .batcher
            .reissue_missing_jobs(
                self.batch.as_mut(),
                &self.store,
                &mut self.state,
                self.cfg.missing_job_threshold,
            )
            .await?;
        if quiet {
            self.last_rescue = Instant::now();
        } else {
            // Jobs are still missing: come back sooner, but not immediately.
            self.last_rescue += MasterConfig::RESCUE_RETRY_ADVANCE;
        }
        info!("rescued any missing jobs");
        Ok(())
    }
}
