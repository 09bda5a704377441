use std::path::PathBuf;

use clap::{Parser, ValueEnum};

pub fn default_parallel() -> u16 {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(512) as u16
}

/// Batch-execution backend used to run worker commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BatchKind {
    /// Bounded pool of processes on this machine.
    Local,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "arbor", version, about = "Arbor job-tree workflow master")]
pub struct Cli {
    /// Workflow directory containing config.xml and the job records.
    pub job_tree: PathBuf,

    /// Batch-execution backend.
    #[arg(long, env = "ARBOR_BATCH_SYSTEM", value_enum, default_value_t = BatchKind::Local)]
    pub batch_system: BatchKind,

    /// Number of worker processes the local backend runs in parallel.
    #[arg(
        short = 'p',
        long,
        env = "ARBOR_PARALLEL",
        default_value_t = default_parallel(),
        value_parser = clap::value_parser!(u16).range(1..=512)
    )]
    pub parallel: u16,
}
