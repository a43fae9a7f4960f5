// src/cli.rs
use crate::cache::{LocalRunLock, RedisRunLock, SharedRunLock};
use crate::config::{PipelineConfig, SectorAssignment};
use crate::database::models::AssetClass;
use crate::database::{MemoryWarehouse, PostgresWarehouse, SharedWarehouse, Warehouse};
use crate::enrichment::EnrichmentStage;
use crate::monitor::{check_coverage, check_freshness, overall_status, table_counts};
use crate::processor::calendar::date_dimension_range;
use crate::processor::jobs::{find_job, standard_jobs};
use crate::processor::pipeline::{backfill_stage, build_graph, top_news_stage, PipelineDeps};
use crate::processor::{Executor, ExecutorConfig, RunContext, RunSummary, Trigger};
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dipsignal-pipeline")]
#[command(about = "Market data collection and AI enrichment pipeline", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./dipsignal.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Write to an in-memory warehouse instead of Postgres
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the scheduler
    Start {
        /// Run in the background
        #[arg(short, long)]
        detached: bool,
    },

    /// Stop the background scheduler
    Stop,

    /// Show whether the background scheduler is running
    Status,

    /// Run one job now
    Run {
        /// Job name (daily_pipeline or weekly_portfolio_job)
        job: String,

        /// Run date (YYYY-MM-DD), defaults to today in the schedule timezone
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Run selected nodes in dependency order
    Materialize {
        #[arg(required = true)]
        nodes: Vec<String>,

        /// Also run everything downstream of the selected nodes
        #[arg(long)]
        downstream: bool,

        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Print a job's execution order without running it
    Plan {
        job: String,
    },

    /// Freshness of every monitored table
    Freshness {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Share of assets with a price bar on a date
    Coverage {
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Row count per monitored table
    Counts,

    /// Run a read-only SQL statement
    Query {
        sql: String,
    },

    /// Create the warehouse schema
    InitDb,

    /// Populate the date dimension
    SeedDates {
        #[arg(long)]
        start: NaiveDate,

        #[arg(long)]
        end: NaiveDate,
    },

    /// Write the configured equity sectors into the asset dimension
    SeedSectors,

    /// Summarize every article that still lacks a summary
    BackfillSummaries,

    /// Rebuild the top-news ranking even if one exists
    RegenerateTopNews {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

/// Process-wide handles built from configuration.
pub struct Runtime {
    pub config: PipelineConfig,
    pub deps: PipelineDeps,
}

impl Runtime {
    pub async fn connect(config: PipelineConfig, dry_run: bool) -> Result<Self> {
        let warehouse: SharedWarehouse = if dry_run {
            warn!("Dry run: writes go to an in-memory warehouse");
            Arc::new(MemoryWarehouse::new())
        } else {
            Arc::new(connect_postgres(&config).await?)
        };
        let lock = run_lock(&config).await?;
        let deps = PipelineDeps::http(&config, warehouse, lock)
            .context("Failed to build HTTP clients")?;
        Ok(Self { config, deps })
    }

    pub fn executor(&self) -> Result<Executor> {
        let graph = build_graph(&self.config, &self.deps).context("Invalid task graph")?;
        Ok(Executor::new(
            Arc::new(graph),
            ExecutorConfig::from(&self.config.scheduler),
        ))
    }

    pub fn trigger(&self) -> Result<Trigger> {
        let jobs = standard_jobs(&self.config.schedule)?;
        Trigger::new(self.executor()?, jobs, self.deps.lock.clone(), &self.config)
    }

    pub async fn close(&self) {
        self.deps.warehouse.close().await;
    }
}

async fn connect_postgres(config: &PipelineConfig) -> Result<PostgresWarehouse> {
    PostgresWarehouse::connect(
        &config.database.url,
        config.database.max_connections,
        Duration::from_secs(config.database.connect_timeout_secs),
    )
    .await
}

async fn run_lock(config: &PipelineConfig) -> Result<SharedRunLock> {
    match &config.redis.url {
        Some(url) => {
            let lock = RedisRunLock::new(url, config.redis.max_connections).await?;
            Ok(Arc::new(lock))
        }
        None => {
            info!("No Redis URL configured - run locks are local to this process");
            Ok(Arc::new(LocalRunLock::new()))
        }
    }
}

/// A shutdown flag flipped by Ctrl-C or SIGTERM.
pub fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Runs the scheduler in the foreground until a shutdown signal arrives.
pub async fn run_scheduler(config: PipelineConfig, dry_run: bool) -> Result<()> {
    let runtime = Runtime::connect(config, dry_run).await?;
    let trigger = Arc::new(runtime.trigger()?);
    for (job, at) in trigger.upcoming(Utc::now()) {
        info!("Scheduled {} ({}) - next run at {}", job.name, job.schedule, at);
    }
    let outcome = trigger.run_forever(shutdown_channel()).await;
    runtime.close().await;
    outcome
}

fn print_summary(summary: &RunSummary) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    if summary.failed > 0 {
        anyhow::bail!("{} of {} nodes failed", summary.failed, summary.nodes.len());
    }
    Ok(())
}

async fn init_db(config: &PipelineConfig) -> Result<()> {
    let warehouse = connect_postgres(config).await?;
    let outcome = warehouse.init_schema().await;
    warehouse.close().await;
    outcome?;
    println!("Schema initialised.");
    Ok(())
}

fn print_plan(config: &PipelineConfig, job: &str) -> Result<()> {
    let deps = PipelineDeps::http(
        config,
        Arc::new(MemoryWarehouse::new()),
        Arc::new(LocalRunLock::new()),
    )?;
    let graph = build_graph(config, &deps)?;
    let jobs = standard_jobs(&config.schedule)?;
    let job = find_job(&jobs, job)?;
    println!("{} - {}", job.name, job.description);
    println!("Schedule: {} ({})", job.schedule, config.schedule.timezone);
    for (i, name) in graph.execution_order(&job.nodes)?.iter().enumerate() {
        let Some(node) = graph.node(name) else { continue };
        let quota = node.quota.map(|q| q.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:>2}. {:<32} {:<16} quota={:<6} after=[{}]",
            i + 1,
            name,
            node.group.as_str(),
            quota,
            node.dependencies.join(", ")
        );
    }
    Ok(())
}

/// Executes every command except the daemon lifecycle ones.
pub async fn execute_command(cli: Cli) -> Result<()> {
    let config = PipelineConfig::load(cli.config.as_deref())?;

    // These need no HTTP clients or run locks.
    match &cli.command {
        Commands::InitDb => return init_db(&config).await,
        Commands::Plan { job } => return print_plan(&config, job),
        Commands::Start { .. } | Commands::Stop | Commands::Status => {
            anyhow::bail!("daemon commands are handled by the binary entry point")
        }
        _ => {}
    }

    let runtime = Runtime::connect(config, cli.dry_run).await?;
    let outcome = dispatch(&runtime, cli.command).await;
    runtime.close().await;
    outcome
}

/// Creates missing equities so sectors can be seeded before the first fetch.
pub async fn seed_sectors(warehouse: &dyn Warehouse, sectors: &[SectorAssignment]) -> Result<usize> {
    let mut written = 0;
    for entry in sectors {
        warehouse
            .get_or_create_asset(&entry.symbol, AssetClass::Equity, &entry.symbol)
            .await?;
        if warehouse.set_asset_sector(&entry.symbol, &entry.sector).await? {
            written += 1;
        }
    }
    info!("Seeded {} sector assignments", written);
    Ok(written)
}

async fn dispatch(runtime: &Runtime, command: Commands) -> Result<()> {
    let warehouse = runtime.deps.warehouse.as_ref();

    match command {
        Commands::Run { job, date } => {
            let trigger = runtime.trigger()?;
            let run_date = date.unwrap_or_else(|| trigger.today());
            match trigger.run_job(&job, run_date, shutdown_channel()).await? {
                Some(summary) => print_summary(&summary)?,
                None => println!("Job {} is already running.", job),
            }
        }

        Commands::Materialize { nodes, downstream, date } => {
            let executor = runtime.executor()?;
            let selected = if downstream {
                executor.graph().with_downstream(&nodes)?
            } else {
                nodes
            };
            let run_date = date.unwrap_or_else(|| Utc::now().date_naive());
            let ctx = RunContext::new("materialize", run_date, shutdown_channel());
            let summary = executor.run(&selected, &ctx).await?;
            print_summary(&summary)?;
        }

        Commands::Freshness { json } => {
            let reports = check_freshness(warehouse, Utc::now()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for r in &reports {
                    let hours = r
                        .hours_since_last_update
                        .map(|h| format!("{:.1}h", h))
                        .unwrap_or_else(|| "no data".to_string());
                    let latest = r
                        .latest_timestamp
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{:<32} {:<9} {:>10}  {}", r.table_name, r.status, hours, latest);
                }
                println!("Overall: {}", overall_status(&reports));
            }
        }

        Commands::Coverage { date } => {
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let report = check_coverage(warehouse, date).await?;
            for class in &report.classes {
                println!(
                    "{:<10} {:>4}/{:<4} {:>5.1}%",
                    class.asset_class,
                    class.assets_with_data,
                    class.total_assets,
                    class.fraction * 100.0
                );
            }
            println!(
                "Total      {:>4}/{:<4} {:>5.1}%",
                report.assets_with_data,
                report.total_assets,
                report.fraction * 100.0
            );
        }

        Commands::Counts => {
            for (table, count) in table_counts(warehouse).await? {
                println!("{:<32} {:>10}", table.table_name(), count);
            }
        }

        Commands::Query { sql } => {
            let rows = warehouse.read_only_query(&sql).await?;
            for row in &rows {
                println!("{}", row);
            }
            println!("({} rows)", rows.len());
        }

        Commands::SeedDates { start, end } => {
            if end < start {
                anyhow::bail!("--end {} is before --start {}", end, start);
            }
            let rows = date_dimension_range(start, end);
            let written = warehouse.upsert_date_dimension(&rows).await?;
            println!("Seeded {} dates ({} to {}).", written, start, end);
        }

        Commands::SeedSectors => {
            let written = seed_sectors(warehouse, &runtime.config.assets.sectors).await?;
            println!("Assigned sectors to {} equities.", written);
        }

        Commands::BackfillSummaries => {
            let stage = backfill_stage(&runtime.config, &runtime.deps);
            let ctx = RunContext::new("backfill_summaries", Utc::now().date_naive(), shutdown_channel());
            let report = stage.run(&ctx).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::RegenerateTopNews { date } => {
            let stage = top_news_stage(&runtime.config, &runtime.deps).forced(true);
            let run_date = date.unwrap_or_else(|| Utc::now().date_naive());
            let report = stage.run(&RunContext::detached("regenerate_top_news", run_date)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Start { .. }
        | Commands::Stop
        | Commands::Status
        | Commands::InitDb
        | Commands::Plan { .. } => anyhow::bail!("command does not need a runtime"),
    }

    Ok(())
}
