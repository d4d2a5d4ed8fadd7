//! Operational entry points for the scheme sync pipeline.

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use yojana_sync::{SyncPipeline, SyncScheduler, TriggerOutcome};

#[derive(Debug, Parser)]
#[command(name = "yojana")]
#[command(about = "Government scheme sync pipeline")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync now and exit (0 on success, non-zero otherwise)
    Sync,
    /// Run the daily cron scheduler until interrupted
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let pipeline = Arc::new(SyncPipeline::from_env().await?);
    let scheduler = SyncScheduler::new(pipeline.clone());

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => match scheduler.trigger().await {
            TriggerOutcome::Completed(summary) => {
                println!(
                    "sync complete: run_id={} changed={} inserted={} updated={} touched={} skipped={} failed={}",
                    summary.run_id,
                    summary.changed,
                    summary.inserted,
                    summary.updated,
                    summary.touched,
                    summary.skipped_records,
                    summary.failed_records
                );
            }
            TriggerOutcome::Failed(err) => return Err(err.into()),
            TriggerOutcome::Dropped => bail!("another sync run is already in progress"),
        },
        Commands::Schedule => {
            let mut sched = scheduler.start(pipeline.cron_expression()).await?;
            tokio::signal::ctrl_c().await?;
            info!("shutdown requested; waiting for in-flight run to finish");
            sched.shutdown().await?;
            scheduler.wait_idle().await;
        }
    }

    Ok(())
}
