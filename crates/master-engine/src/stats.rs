//! Collates per-worker stat fragments into the workflow's stats file.
//!
//! Workers publish fragments by writing a `.new` sibling and renaming it
//! into place; the `.new` filter below is the entire visibility protocol.
//! The aggregator only appends raw lines, it never parses fragment content.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use arbor_master_core::cputime::total_cpu_time;
use arbor_master_core::layout;

/// How long to sleep after a scan that found nothing.
const IDLE_SLEEP: Duration = Duration::from_millis(500);

/// How often the output file is flushed.
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// What the aggregator did, reported once it has drained.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatsSummary {
    pub(crate) files_processed: u64,
    pub(crate) elapsed: Duration,
}

/// Handle to the aggregation thread.
pub(crate) struct StatsAggregator {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<anyhow::Result<StatsSummary>>,
}

impl StatsAggregator {
    /// Start aggregating on a blocking thread.
    pub(crate) fn spawn(job_tree: PathBuf, shard_dirs: Vec<PathBuf>) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle =
            tokio::task::spawn_blocking(move || aggregate(&job_tree, &shard_dirs, stop_rx));
        Self { stop_tx, handle }
    }

    /// Signal the aggregator to drain and wait for it to finish.
    pub(crate) async fn stop(self) -> anyhow::Result<StatsSummary> {
        let _ = self.stop_tx.send(());
        self.handle
            .await
            .map_err(|err| anyhow::anyhow!("stats aggregator panicked: {err}"))?
    }
}

fn aggregate(
    job_tree: &Path,
    shard_dirs: &[PathBuf],
    mut stop_rx: oneshot::Receiver<()>,
) -> anyhow::Result<StatsSummary> {
    let started = Instant::now();
    let started_clock = total_cpu_time();

    let path = layout::stats_file(job_tree);
    let file =
        File::create(&path).with_context(|| format!("create stats file {}", path.display()))?;
    let mut out = BufWriter::new(file);
    out.write_all(br#"<?xml version="1.0" ?><stats>"#)?;

    let mut files_processed = 0u64;
    let mut last_flush = Instant::now();
    loop {
        let processed = scan_and_scrape(shard_dirs, &mut out)?;
        files_processed += processed;

        match stop_rx.try_recv() {
            Err(oneshot::error::TryRecvError::Empty) => {}
            // Either a stop signal or the master dropped the sender: one
            // final scan picks up late arrivals, then we are done.
            _ => {
                files_processed += scan_and_scrape(shard_dirs, &mut out)?;
                break;
            }
        }
        if processed == 0 {
            std::thread::sleep(IDLE_SLEEP);
        }
        if last_flush.elapsed() >= FLUSH_INTERVAL {
            out.flush()?;
            last_flush = Instant::now();
        }
    }

    let elapsed = started.elapsed();
    write!(
        out,
        "<total_time time='{}' clock='{}'/></stats>",
        elapsed.as_secs_f64(),
        total_cpu_time() - started_clock
    )?;
    out.flush()?;
    debug!(files = files_processed, "stats aggregation finished");
    Ok(StatsSummary {
        files_processed,
        elapsed,
    })
}

/// One pass over every shard: append each published fragment, delete it.
fn scan_and_scrape(shard_dirs: &[PathBuf], out: &mut impl Write) -> anyhow::Result<u64> {
    let mut processed = 0u64;
    for dir in shard_dirs {
        for entry in
            std::fs::read_dir(dir).with_context(|| format!("list shard {}", dir.display()))?
        {
            let entry = entry?;
            if entry.file_name().to_string_lossy().ends_with(".new") {
                continue; // still being written
            }
            let path = entry.path();
            let content = std::fs::read(&path)
                .with_context(|| format!("read stat fragment {}", path.display()))?;
            out.write_all(&content)?;
            std::fs::remove_file(&path)
                .with_context(|| format!("remove stat fragment {}", path.display()))?;
            processed += 1;
        }
    }
    Ok(processed)
}
