//! Locations of the files that make up a workflow directory.

use std::path::{Path, PathBuf};

use anyhow::Context as _;

/// Subdirectory names of the two-level stats shard tree.
pub const STAT_SHARD_NAMES: [&str; 10] = ["1", "2", "3", "4", "5", "6", "7", "8", "9", "10"];

/// The workflow's `config.xml`.
pub fn config_file(job_tree: &Path) -> PathBuf {
    job_tree.join("config.xml")
}

/// Environment snapshot captured at workflow start (opaque to the master).
pub fn environ_file(job_tree: &Path) -> PathBuf {
    job_tree.join("environ.json")
}

/// Aggregated stats output, present only when stats are enabled.
pub fn stats_file(job_tree: &Path) -> PathBuf {
    job_tree.join("stats.xml")
}

/// Results spool used by some batch system adapters (opaque to the master).
pub fn results_file(job_tree: &Path) -> PathBuf {
    job_tree.join("results.txt")
}

/// Directory holding one record file per job.
pub fn jobs_dir(job_tree: &Path) -> PathBuf {
    job_tree.join("jobs")
}

/// Record file of a single job.
pub fn job_file(job_tree: &Path, job_store_id: &str) -> PathBuf {
    jobs_dir(job_tree).join(format!("{job_store_id}.json"))
}

/// Create the `stats/<1..10>/<1..10>` shard directories, returning every leaf.
///
/// Workers spread their stat fragments over these 100 leaves to keep any one
/// directory listing short.
pub fn make_stats_shard_dirs(job_tree: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let stats_dir = job_tree.join("stats");
    let mut leaves = Vec::with_capacity(STAT_SHARD_NAMES.len() * STAT_SHARD_NAMES.len());
    for d1 in STAT_SHARD_NAMES {
        for d2 in STAT_SHARD_NAMES {
            let leaf = stats_dir.join(d1).join(d2);
            std::fs::create_dir_all(&leaf)
                .with_context(|| format!("create stats shard {}", leaf.display()))?;
            leaves.push(leaf);
        }
    }
    Ok(leaves)
}
