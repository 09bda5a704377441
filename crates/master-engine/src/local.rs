//! Single-machine batch system: a bounded pool of worker processes.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{Mutex, Notify, Semaphore, mpsc, oneshot};
use tracing::debug;

use crate::batch::{BatchSystem, JobId};

/// Exit code reported for jobs killed before or during execution.
const KILLED_EXIT_CODE: i32 = 1;

/// Exit code reported when the worker process cannot be spawned.
const SPAWN_FAILED_EXIT_CODE: i32 = 127;

/// Runs each issued command as a child process, at most `slots` at a time.
///
/// Jobs beyond the slot limit queue inside their reaper task; a queued job
/// counts as issued but not as running. Children get a cleared environment
/// and are launched from the argv directly, with no shell in between.
pub struct LocalBatchSystem {
    next_id: JobId,
    slots: Arc<Semaphore>,
    issued: HashMap<JobId, Instant>,
    kill_txs: HashMap<JobId, oneshot::Sender<()>>,
    running: Arc<Mutex<HashMap<JobId, Instant>>>,
    updates_tx: mpsc::UnboundedSender<(JobId, i32)>,
    updates_rx: mpsc::UnboundedReceiver<(JobId, i32)>,
    reaped: Arc<Notify>,
}

impl LocalBatchSystem {
    /// A pool running at most `slots` processes at once.
    pub fn new(slots: usize) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            next_id: 1,
            slots: Arc::new(Semaphore::new(slots.max(1))),
            issued: HashMap::new(),
            kill_txs: HashMap::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
            updates_tx,
            updates_rx,
            reaped: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl BatchSystem for LocalBatchSystem {
    async fn issue_job(
        &mut self,
        argv: Vec<String>,
        _memory: u64,
        _cpu: u32,
    ) -> anyhow::Result<JobId> {
        if argv.is_empty() {
            anyhow::bail!("refusing to issue a job with an empty argv");
        }
        let id = self.next_id;
        self.next_id += 1;

        let (kill_tx, kill_rx) = oneshot::channel();
        self.issued.insert(id, Instant::now());
        self.kill_txs.insert(id, kill_tx);

        spawn_reaper(
            id,
            argv,
            self.slots.clone(),
            self.running.clone(),
            self.updates_tx.clone(),
            self.reaped.clone(),
            kill_rx,
        );
        Ok(id)
    }

    async fn kill_jobs(&mut self, ids: &[JobId]) -> anyhow::Result<()> {
        for id in ids {
            if let Some(tx) = self.kill_txs.remove(id) {
                let _ = tx.send(());
            }
        }
        // Wait until none of them is still executing.
        loop {
            let notified = self.reaped.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let running = self.running.lock().await;
                if ids.iter().all(|id| !running.contains_key(id)) {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    async fn issued_job_ids(&mut self) -> anyhow::Result<HashSet<JobId>> {
        Ok(self.issued.keys().copied().collect())
    }

    async fn running_job_ids(&mut self) -> anyhow::Result<HashMap<JobId, f64>> {
        let running = self.running.lock().await;
        Ok(running
            .iter()
            .map(|(id, started)| (*id, started.elapsed().as_secs_f64()))
            .collect())
    }

    async fn wait_updated_job(
        &mut self,
        timeout: Duration,
    ) -> anyhow::Result<Option<(JobId, i32)>> {
        match tokio::time::timeout(timeout, self.updates_rx.recv()).await {
            Ok(Some((id, code))) => {
                self.issued.remove(&id);
                self.kill_txs.remove(&id);
                Ok(Some((id, code)))
            }
            // The channel cannot close while we hold a sender.
            Ok(None) | Err(_) => Ok(None),
        }
    }
}

fn spawn_reaper(
    id: JobId,
    argv: Vec<String>,
    slots: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<JobId, Instant>>>,
    updates_tx: mpsc::UnboundedSender<(JobId, i32)>,
    reaped: Arc<Notify>,
    mut kill_rx: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        let permit = tokio::select! {
            permit = slots.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return, // pool dropped
            },
            _ = &mut kill_rx => {
                // Killed while still queued: it never ran.
                let _ = updates_tx.send((id, KILLED_EXIT_CODE));
                reaped.notify_waiters();
                return;
            }
        };

        let code = execute(id, &argv, &running, &mut kill_rx).await;
        drop(permit);

        running.lock().await.remove(&id);
        let _ = updates_tx.send((id, code));
        reaped.notify_waiters();
    });
}

async fn execute(
    id: JobId,
    argv: &[String],
    running: &Mutex<HashMap<JobId, Instant>>,
    kill_rx: &mut oneshot::Receiver<()>,
) -> i32 {
    let Some((program, args)) = argv.split_first() else {
        // Unreachable: argv is checked at issue time.
        return SPAWN_FAILED_EXIT_CODE;
    };

    let mut child = match Command::new(program)
        .args(args)
        .env_clear()
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            debug!(job_id = id, program = %program, error = %err, "failed to spawn worker");
            return SPAWN_FAILED_EXIT_CODE;
        }
    };
    running.lock().await.insert(id, Instant::now());

    tokio::select! {
        status = child.wait() => match status {
            // A signal death has no code; report it as a plain failure.
            Ok(status) => status.code().unwrap_or(KILLED_EXIT_CODE),
            Err(_) => KILLED_EXIT_CODE,
        },
        _ = kill_rx => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            KILLED_EXIT_CODE
        }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completed_job_is_reaped_with_its_exit_code() {
        let mut pool = LocalBatchSystem::new(2);
        let ok = pool
            .issue_job(vec!["/bin/true".to_string()], 0, 1)
            .await
            .unwrap();
        let bad = pool
            .issue_job(vec!["/bin/false".to_string()], 0, 1)
            .await
            .unwrap();
        assert_eq!(pool.issued_job_ids().await.unwrap().len(), 2);

        let mut seen = HashMap::new();
        for _ in 0..2 {
            let (id, code) = pool
                .wait_updated_job(Duration::from_secs(10))
                .await
                .unwrap()
                .expect("completion");
            seen.insert(id, code);
        }
        assert_eq!(seen.get(&ok), Some(&0));
        assert_eq!(seen.get(&bad), Some(&1));
        assert!(pool.issued_job_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wait_times_out_when_nothing_finishes() {
        let mut pool = LocalBatchSystem::new(1);
        let got = pool
            .wait_updated_job(Duration::from_millis(10))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn killing_a_running_job_reports_a_failure() {
        let mut pool = LocalBatchSystem::new(1);
        let id = pool
            .issue_job(vec!["/bin/sleep".to_string(), "30".to_string()], 0, 1)
            .await
            .unwrap();

        // Let it actually start.
        while pool.running_job_ids().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        pool.kill_jobs(&[id]).await.unwrap();
        assert!(pool.running_job_ids().await.unwrap().is_empty());

        let (done, code) = pool
            .wait_updated_job(Duration::from_secs(10))
            .await
            .unwrap()
            .expect("completion");
        assert_eq!(done, id);
        assert_ne!(code, 0);
    }

    #[tokio::test]
    async fn killing_a_queued_job_never_runs_it() {
        let mut pool = LocalBatchSystem::new(1);
        let hog = pool
            .issue_job(vec!["/bin/sleep".to_string(), "30".to_string()], 0, 1)
            .await
            .unwrap();
        // Make sure the hog holds the only slot before queueing behind it.
        while pool.running_job_ids().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let queued = pool
            .issue_job(vec!["/bin/true".to_string()], 0, 1)
            .await
            .unwrap();

        pool.kill_jobs(&[queued]).await.unwrap();
        let (id, code) = pool
            .wait_updated_job(Duration::from_secs(10))
            .await
            .unwrap()
            .expect("completion");
        assert_eq!(id, queued);
        assert_ne!(code, 0);

        pool.kill_jobs(&[hog]).await.unwrap();
    }
}
