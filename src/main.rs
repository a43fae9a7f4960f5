// src/main.rs
use anyhow::Result;
use clap::Parser;
use dipsignal_pipeline::cli::{execute_command, run_scheduler, Cli, Commands};
use dipsignal_pipeline::config::PipelineConfig;
use dipsignal_pipeline::daemon::{check_daemon_status, start_daemon, stop_daemon};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { detached } => {
            if detached {
                start_daemon(cli.config, cli.dry_run).await?;
            } else {
                let config = PipelineConfig::load(cli.config.as_deref())?;
                run_scheduler(config, cli.dry_run).await?;
            }
        }
        Commands::Stop => {
            stop_daemon().await?;
        }
        Commands::Status => {
            check_daemon_status().await?;
        }
        _ => {
            execute_command(cli).await?;
        }
    }

    Ok(())
}
