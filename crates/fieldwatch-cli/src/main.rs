use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fieldwatch_sync::{SyncConfig, SyncPipeline};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "fieldwatch")]
#[command(about = "Fieldwatch command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle and print the counts.
    Sync,
    /// Sync once, start the scheduler, and serve the read API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Sync => {
            let summary = fieldwatch_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} issues={} images={} responses={}",
                summary.run_id,
                summary.issues_updated,
                summary.images_stored,
                summary.responses_stored
            );
        }
        Commands::Serve => {
            let pipeline = Arc::new(SyncPipeline::new(SyncConfig::from_env()).await?);
            if let Err(err) = pipeline.run_once().await {
                error!(error = %err, "initial sync failed, serving existing data");
            }
            let _scheduler = pipeline.clone().maybe_build_scheduler().await?;
            info!("starting web server");
            fieldwatch_web::serve_from_env(pipeline).await?;
        }
    }

    Ok(())
}
