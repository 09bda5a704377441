//! The persistent job record.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One pending child of a job, to be run before the job's own follow-ons.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChildSpec {
    /// Record id of the child job.
    pub job_store_id: String,
    /// Memory request in bytes, passed through to the batch system.
    pub memory: u64,
    /// CPU request, passed through to the batch system.
    pub cpu: u32,
}

/// A command that runs once all of a job's children have completed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FollowOn {
    /// Opaque command line, interpreted by the worker.
    pub command: String,
    /// Memory request in bytes.
    pub memory: u64,
    /// CPU request.
    pub cpu: u32,
    /// Retry budget granted to this command when it was queued.
    pub retry_budget: u32,
}

/// A persisted job record.
///
/// `follow_on_commands` is a stack: the top entry is the next command to run.
/// The worker contract is that the command it just ran stays on top until the
/// master pops it, so anything a worker appends goes beneath the top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Stable, opaque id; doubles as the record filename stem.
    pub job_store_id: String,
    /// Children still owned by this job (issued before its follow-ons run).
    #[serde(default)]
    pub children: Vec<ChildSpec>,
    /// Stack of commands to run after the children, top last.
    #[serde(default)]
    pub follow_on_commands: Vec<FollowOn>,
    /// Retries left for the current top follow-on.
    #[serde(default)]
    pub remaining_retry_count: u32,
    /// Messages queued by workers, surfaced and cleared by the master.
    #[serde(default)]
    pub messages: Vec<String>,
    /// Working directory for the executor.
    #[serde(default)]
    pub cwd: PathBuf,
    /// Environment snapshot for the executor.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl Job {
    /// A record with a single queued command.
    pub fn with_command(
        job_store_id: impl Into<String>,
        command: impl Into<String>,
        memory: u64,
        cpu: u32,
        retries: u32,
    ) -> Self {
        Self {
            job_store_id: job_store_id.into(),
            children: Vec::new(),
            follow_on_commands: vec![FollowOn {
                command: command.into(),
                memory,
                cpu,
                retry_budget: retries,
            }],
            remaining_retry_count: retries,
            messages: Vec::new(),
            cwd: PathBuf::new(),
            environment: BTreeMap::new(),
        }
    }

    /// Whether anything remains to schedule for this job.
    pub fn has_work(&self) -> bool {
        !self.children.is_empty() || !self.follow_on_commands.is_empty()
    }
}
