mod cli;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use arbor_master_core::config::WorkflowConfig;
use arbor_master_engine::{BatchSystem, LocalBatchSystem, MasterConfig, run_master};

use crate::cli::{BatchKind, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let workflow = WorkflowConfig::load(&cli.job_tree)?;
    let config = MasterConfig::from_workflow(&workflow);

    let batch: Box<dyn BatchSystem> = match cli.batch_system {
        BatchKind::Local => Box::new(LocalBatchSystem::new(cli.parallel as usize)),
    };

    info!(
        job_tree = %config.job_tree.display(),
        batch_system = ?cli.batch_system,
        parallel = cli.parallel,
        "arbor {} starting",
        env!("CARGO_PKG_VERSION")
    );

    let failed = run_master(config, batch).await?;
    if failed > 0 {
        // Callers check the exit status for the permanently-failed count.
        std::process::exit(failed.min(255) as i32);
    }
    Ok(())
}
