//! File-backed job store and the in-memory tree state.
//!
//! One JSON record per job lives under `jobs/` in the workflow directory.
//! Every mutation is a whole-record write through a `.tmp` sibling and an
//! atomic rename, so a crash at any point leaves either the old record or
//! the new one, never a torn file.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, bail};
use tracing::{debug, warn};

use crate::job::Job;
use crate::layout;

/// In-memory projection of the job tree, rebuilt from the store at startup.
#[derive(Debug, Default)]
pub struct TreeState {
    /// Jobs awaiting scheduler attention.
    pub updated_jobs: BTreeSet<String>,
    /// Parent job id to its number of issued, not-yet-finished children.
    pub child_counts: HashMap<String, usize>,
    /// Child job id to parent job id, one entry per outstanding child.
    pub child_to_parent: HashMap<String, String>,
}

/// Store of persistent job records under a workflow directory.
pub struct JobStore {
    job_tree: PathBuf,
}

impl JobStore {
    /// Open the store, creating the records directory if needed.
    pub fn open(job_tree: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let job_tree = job_tree.into();
        let jobs_dir = layout::jobs_dir(&job_tree);
        std::fs::create_dir_all(&jobs_dir)
            .with_context(|| format!("create jobs dir {}", jobs_dir.display()))?;
        Ok(Self { job_tree })
    }

    /// The workflow directory this store lives in.
    pub fn job_tree(&self) -> &Path {
        &self.job_tree
    }

    /// Absolute path of a job's record file.
    pub fn job_file(&self, job_store_id: &str) -> PathBuf {
        layout::job_file(&self.job_tree, job_store_id)
    }

    /// Read one record.
    pub fn load(&self, job_store_id: &str) -> anyhow::Result<Job> {
        let path = self.job_file(job_store_id);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read job record {}", path.display()))?;
        let job = serde_json::from_str(&raw)
            .with_context(|| format!("parse job record {}", path.display()))?;
        Ok(job)
    }

    /// Write one record atomically.
    pub fn save(&self, job: &Job) -> anyhow::Result<()> {
        let path = self.job_file(&job.job_store_id);
        let json = serde_json::to_string_pretty(job)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("write job record {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("publish job record {}", path.display()))?;
        Ok(())
    }

    /// Delete one record.
    pub fn remove(&self, job_store_id: &str) -> anyhow::Result<()> {
        let path = self.job_file(job_store_id);
        std::fs::remove_file(&path)
            .with_context(|| format!("remove job record {}", path.display()))?;
        Ok(())
    }

    fn load_all(&self) -> anyhow::Result<HashMap<String, Job>> {
        let jobs_dir = layout::jobs_dir(&self.job_tree);
        let mut jobs = HashMap::new();
        for entry in std::fs::read_dir(&jobs_dir)
            .with_context(|| format!("list jobs dir {}", jobs_dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stem) = name.to_string_lossy().strip_suffix(".json").map(str::to_string)
            else {
                continue; // .tmp leftovers and strays
            };
            let job = self.load(&stem)?;
            jobs.insert(job.job_store_id.clone(), job);
        }
        Ok(jobs)
    }

    /// Rebuild the tree state from the records on disk.
    ///
    /// Records that ran out of work but were not destroyed before a crash
    /// are swept here: the record is deleted and the entry removed from its
    /// parent's children list. `child_counts` and `child_to_parent` are
    /// then rebuilt directly from each surviving parent's persisted
    /// `children` list, and every record whose own list is empty enters
    /// `updated_jobs` — whether or not a parent still lists it — so each
    /// outstanding command re-issues while parents wait on the registered
    /// counts, exactly as in steady state.
    pub fn load_tree_state(&self) -> anyhow::Result<TreeState> {
        let mut jobs = self.load_all()?;

        // Sweep fully-finished records left behind by a crash.
        loop {
            let done: Vec<String> = jobs
                .values()
                .filter(|job| !job.has_work())
                .map(|job| job.job_store_id.clone())
                .collect();
            if done.is_empty() {
                break;
            }
            for id in &done {
                jobs.remove(id);
                self.remove(id)?;
                debug!(job = %id, "swept finished record");
            }
            for parent in jobs.values_mut() {
                let before = parent.children.len();
                parent.children.retain(|child| !done.contains(&child.job_store_id));
                if parent.children.len() != before {
                    self.save(parent)?;
                }
            }
        }

        // Prune references to records that no longer exist.
        let ids: HashSet<String> = jobs.keys().cloned().collect();
        for parent in jobs.values_mut() {
            let before = parent.children.len();
            parent.children.retain(|child| ids.contains(&child.job_store_id));
            if parent.children.len() != before {
                warn!(job = %parent.job_store_id, "pruned children with no record");
                self.save(parent)?;
            }
        }

        let mut state = TreeState::default();
        for parent in jobs.values() {
            for child in &parent.children {
                let prev = state
                    .child_to_parent
                    .insert(child.job_store_id.clone(), parent.job_store_id.clone());
                if prev.is_some() {
                    bail!(
                        "job {} is listed as a child of more than one parent",
                        child.job_store_id
                    );
                }
            }
            if !parent.children.is_empty() {
                state
                    .child_counts
                    .insert(parent.job_store_id.clone(), parent.children.len());
            }
        }
        for job in jobs.values() {
            if job.children.is_empty() {
                state.updated_jobs.insert(job.job_store_id.clone());
            }
        }

        debug!(
            jobs = jobs.len(),
            ready = state.updated_jobs.len(),
            parents = state.child_counts.len(),
            "loaded tree state"
        );
        Ok(state)
    }

    /// Apply the outcome of one finished command to the tree.
    ///
    /// A nonzero exit decrements the retry budget and re-queues the job for
    /// the scheduler's retry decision. A zero exit pops the follow-on that
    /// just ran; when nothing remains the record is destroyed and the
    /// completion cascades up through parents whose last child finished.
    pub fn process_finished_job(
        &self,
        state: &mut TreeState,
        job_store_id: &str,
        exit_code: i32,
    ) -> anyhow::Result<()> {
        let mut job = self.load(job_store_id)?;

        if exit_code != 0 {
            job.remaining_retry_count = job.remaining_retry_count.saturating_sub(1);
            self.save(&job)?;
            debug!(
                job = %job_store_id,
                exit_code,
                retries_left = job.remaining_retry_count,
                "job failed, queued for retry decision"
            );
            state.updated_jobs.insert(job_store_id.to_string());
            return Ok(());
        }

        // The command that just ran is the top of the follow-on stack.
        job.follow_on_commands.pop();
        if let Some(next) = job.follow_on_commands.last() {
            job.remaining_retry_count = next.retry_budget;
        }

        if job.has_work() {
            self.save(&job)?;
            state.updated_jobs.insert(job_store_id.to_string());
            return Ok(());
        }
        self.destroy(state, job)
    }

    /// Remove a finished record and walk the completion up the tree.
    fn destroy(&self, state: &mut TreeState, job: Job) -> anyhow::Result<()> {
        let mut current = job;
        loop {
            let id = current.job_store_id.clone();
            self.remove(&id)?;
            state.updated_jobs.remove(&id);

            let Some(parent_id) = state.child_to_parent.remove(&id) else {
                return Ok(());
            };
            let mut parent = self.load(&parent_id)?;
            parent.children.retain(|child| child.job_store_id != id);

            let remaining = match state.child_counts.get_mut(&parent_id) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => bail!("parent {parent_id} of finished job {id} has no child count"),
            };
            if remaining > 0 {
                self.save(&parent)?;
                return Ok(());
            }
            state.child_counts.remove(&parent_id);

            if parent.has_work() {
                self.save(&parent)?;
                debug!(job = %parent_id, "last child finished, parent is ready");
                state.updated_jobs.insert(parent_id);
                return Ok(());
            }
            // The parent ran out of work too.
            current = parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ChildSpec;

    fn store() -> (tempfile::TempDir, JobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn parent_of(store: &JobStore, parent_id: &str, children: &[&str]) {
        let mut parent = Job::with_command(parent_id, "finish", 0, 1, 2);
        parent.children = children
            .iter()
            .map(|id| ChildSpec {
                job_store_id: (*id).to_string(),
                memory: 0,
                cpu: 1,
            })
            .collect();
        store.save(&parent).unwrap();
        for id in children {
            store.save(&Job::with_command(*id, "child", 0, 1, 2)).unwrap();
        }
    }

    #[test]
    fn empty_store_loads_an_empty_state() {
        let (_dir, store) = store();
        let state = store.load_tree_state().unwrap();
        assert!(state.updated_jobs.is_empty());
        assert!(state.child_counts.is_empty());
        assert!(state.child_to_parent.is_empty());
    }

    #[test]
    fn single_job_success_destroys_the_record() {
        let (_dir, store) = store();
        store.save(&Job::with_command("t0", "run", 0, 1, 3)).unwrap();

        let mut state = store.load_tree_state().unwrap();
        assert_eq!(state.updated_jobs, BTreeSet::from(["t0".to_string()]));

        state.updated_jobs.clear(); // as if issued
        store.process_finished_job(&mut state, "t0", 0).unwrap();
        assert!(state.updated_jobs.is_empty());
        assert!(!store.job_file("t0").exists());
    }

    #[test]
    fn failure_decrements_retries_and_requeues() {
        let (_dir, store) = store();
        store.save(&Job::with_command("t0", "run", 0, 1, 2)).unwrap();

        let mut state = store.load_tree_state().unwrap();
        state.updated_jobs.clear();
        store.process_finished_job(&mut state, "t0", 1).unwrap();

        assert_eq!(state.updated_jobs, BTreeSet::from(["t0".to_string()]));
        let job = store.load("t0").unwrap();
        assert_eq!(job.remaining_retry_count, 1);
        assert_eq!(job.follow_on_commands.len(), 1);

        // Round trip: a fresh load sees the same logical state.
        let reloaded = store.load_tree_state().unwrap();
        assert_eq!(reloaded.updated_jobs, state.updated_jobs);
    }

    #[test]
    fn children_finish_before_the_parent_becomes_ready() {
        let (_dir, store) = store();
        parent_of(&store, "p", &["a", "b"]);

        let mut state = store.load_tree_state().unwrap();
        assert_eq!(
            state.updated_jobs,
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
        assert_eq!(state.child_counts.get("p"), Some(&2));
        assert_eq!(state.child_to_parent.get("a"), Some(&"p".to_string()));

        state.updated_jobs.clear();
        store.process_finished_job(&mut state, "a", 0).unwrap();
        assert_eq!(state.child_counts.get("p"), Some(&1));
        assert!(state.updated_jobs.is_empty());
        assert!(!store.job_file("a").exists());
        // The parent record no longer lists the finished child.
        assert_eq!(store.load("p").unwrap().children.len(), 1);

        store.process_finished_job(&mut state, "b", 0).unwrap();
        assert!(state.child_counts.is_empty());
        assert_eq!(state.updated_jobs, BTreeSet::from(["p".to_string()]));
        assert!(store.load("p").unwrap().children.is_empty());
    }

    #[test]
    fn completion_cascades_through_parents_without_follow_ons() {
        let (_dir, store) = store();
        // A parent that exists only to order its child: no follow-ons left.
        let mut parent = Job::with_command("p", "noop", 0, 1, 1);
        parent.follow_on_commands.clear();
        parent.children = vec![ChildSpec {
            job_store_id: "a".to_string(),
            memory: 0,
            cpu: 1,
        }];
        store.save(&parent).unwrap();
        store.save(&Job::with_command("a", "child", 0, 1, 1)).unwrap();

        let mut state = store.load_tree_state().unwrap();
        state.updated_jobs.clear();
        store.process_finished_job(&mut state, "a", 0).unwrap();

        // Both the child and the now-workless parent are gone.
        assert!(!store.job_file("a").exists());
        assert!(!store.job_file("p").exists());
        assert!(state.updated_jobs.is_empty());
        assert!(state.child_counts.is_empty());
    }

    #[test]
    fn popping_a_follow_on_resets_the_retry_budget() {
        let (_dir, store) = store();
        let mut job = Job::with_command("t0", "second", 0, 1, 5);
        job.follow_on_commands.push(crate::job::FollowOn {
            command: "first".to_string(),
            memory: 0,
            cpu: 1,
            retry_budget: 1,
        });
        job.remaining_retry_count = 1;
        store.save(&job).unwrap();

        let mut state = store.load_tree_state().unwrap();
        state.updated_jobs.clear();
        store.process_finished_job(&mut state, "t0", 0).unwrap();

        let job = store.load("t0").unwrap();
        assert_eq!(job.follow_on_commands.len(), 1);
        assert_eq!(job.follow_on_commands[0].command, "second");
        assert_eq!(job.remaining_retry_count, 5);
        assert_eq!(state.updated_jobs, BTreeSet::from(["t0".to_string()]));
    }

    #[test]
    fn load_sweeps_records_that_ran_out_of_work() {
        let (_dir, store) = store();
        parent_of(&store, "p", &["a", "done"]);
        let mut done = store.load("done").unwrap();
        done.follow_on_commands.clear();
        store.save(&done).unwrap();

        let state = store.load_tree_state().unwrap();
        assert!(!store.job_file("done").exists());
        assert_eq!(state.child_counts.get("p"), Some(&1));
        assert_eq!(state.updated_jobs, BTreeSet::from(["a".to_string()]));
    }

    #[test]
    fn duplicate_child_reference_is_fatal() {
        let (_dir, store) = store();
        parent_of(&store, "p1", &["shared"]);
        let mut p2 = Job::with_command("p2", "finish", 0, 1, 1);
        p2.children = vec![ChildSpec {
            job_store_id: "shared".to_string(),
            memory: 0,
            cpu: 1,
        }];
        store.save(&p2).unwrap();

        assert!(store.load_tree_state().is_err());
    }
}
