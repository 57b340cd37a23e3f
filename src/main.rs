//! # Main — CLI Entry Point
//!
//! Routes subcommands to the handlers in [`loadmark::cli`] and owns the
//! shared concerns: `.env` loading, structured logging (JSON for
//! containers via `LOG_FORMAT=json`, human-readable otherwise), the tokio
//! runtime, and process exit codes (0 = COMPLETED, 130 = CANCELLED,
//! non-zero otherwise).

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "loadmark",
    about = "OLTP benchmark harness — weighted workloads, adaptive concurrency, per-operation telemetry"
)]
struct Cli {
    /// PostgreSQL connection URL for the workload target (or set DATABASE_URL)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Results-store connection URL; defaults to the workload URL
    #[arg(long, env = "RESULTS_DATABASE_URL")]
    results_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one benchmark run headlessly (one worker group)
    Run {
        /// Path to the template config JSON
        #[arg(long)]
        template: PathBuf,
        /// Template id recorded with the run (defaults to the table name)
        #[arg(long)]
        template_id: Option<String>,
        /// This node's worker group (0-based)
        #[arg(long, default_value_t = 0)]
        worker_group_id: u32,
        /// Total worker groups across all nodes of this run
        #[arg(long, default_value_t = 1)]
        worker_group_count: u32,
        /// Override the template's concurrent_connections
        #[arg(long)]
        concurrency: Option<u32>,
        /// Override the template's target_qps (QPS mode)
        #[arg(long)]
        target_qps: Option<f64>,
        /// Override the template's duration in seconds
        #[arg(long)]
        duration: Option<u64>,
        /// Directory for durable-sink spool files
        #[arg(long, default_value = "loadmark-spool")]
        spool_dir: PathBuf,
        /// Skip the results store entirely (spool files are the output)
        #[arg(long)]
        no_store: bool,
    },
    /// Validate a template and print the planned schedule
    Validate {
        /// Path to the template config JSON
        #[arg(long)]
        template: PathBuf,
    },
    /// Sample the target table into persisted value pools
    PreparePools {
        /// Path to the template config JSON
        #[arg(long)]
        template: PathBuf,
        /// Pool id to write (defaults to the template's ai_workload.pool_id)
        #[arg(long)]
        pool_id: Option<String>,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Structured logging: LOG_FORMAT=json for containers, human-readable
    // to stderr otherwise (stdout carries the summary JSON).
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt().json().with_target(false).init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            template,
            template_id,
            worker_group_id,
            worker_group_count,
            concurrency,
            target_qps,
            duration,
            spool_dir,
            no_store,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            let code = rt.block_on(loadmark::cli::run_benchmark(loadmark::cli::RunOptions {
                database_url: cli.database_url,
                results_url: cli.results_url,
                template_path: template,
                template_id,
                worker_group_id,
                worker_group_count,
                concurrency,
                target_qps,
                duration,
                spool_dir,
                no_store,
            }))?;
            std::process::exit(code);
        }
        Commands::Validate { template } => loadmark::cli::run_validate(&template),
        Commands::PreparePools { template, pool_id } => {
            let database_url = cli.database_url.as_deref().ok_or_else(|| {
                anyhow::anyhow!("DATABASE_URL is required (set via --database-url or env)")
            })?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(loadmark::cli::run_prepare_pools(
                database_url,
                &template,
                pool_id,
            ))
        }
    }
}
