//! Mnemo Steward command line
//!
//! Runs the steward loop against a local store, or performs single operator
//! actions (one tick, status, scans, rollbacks, job retry/cancel, audit
//! inspection) and prints the result as JSON.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use steward_core::{
    steward::RunFilters, AppConfig, Database, DecisionClient, LocalMemoryService, Manager,
    MemoryService, MergeDecider, OllamaEmbedder,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "mnemo-steward")]
#[command(about = "Background steward for a shared agent memory store", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "STEWARD_CONFIG")]
    config: Option<PathBuf>,

    /// Database path, overriding the configuration
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the steward until interrupted
    Run,

    /// Perform a single tick and print the status
    Once,

    /// Print status, queue health and run metrics
    Status,

    /// Scan for duplicate memories and upsert suggestions
    Scan,

    /// Roll back the latest change of a policy key
    Rollback {
        /// auto_merge_threshold, derivation.min_confidence or derivation.min_novelty
        policy_key: String,
    },

    /// Requeue a failed, dead-lettered or cancelled job
    Retry { job_id: Uuid },

    /// Cancel a queued or running job
    Cancel { job_id: Uuid },

    /// List recent runs
    Runs {
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        job_type: Option<String>,

        #[arg(long, default_value = "50")]
        limit: i64,
    },

    /// List the events of a job, oldest first
    Events {
        job_id: Uuid,

        #[arg(long, default_value = "200")]
        limit: i64,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    debug!("Mnemo Steward v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(db) = cli.db {
        config.database.path = db;
    }

    let db = Database::with_pool_size(&config.database.path, config.database.pool_size)
        .await
        .with_context(|| format!("opening database {}", config.database.path.display()))?;
    let embedder = Arc::new(OllamaEmbedder::new(&config.embeddings)?);
    let memory = Arc::new(LocalMemoryService::new(
        db.clone(),
        embedder,
        config.memory.clone(),
    ));
    let decider: Option<Arc<dyn MergeDecider>> = if config.steward.llm_conflict_guard_enabled {
        Some(Arc::new(DecisionClient::from_config(&config.steward)?))
    } else {
        None
    };
    let manager = Manager::new(
        db,
        Arc::clone(&memory) as Arc<dyn MemoryService>,
        config.steward.clone(),
        decider,
    );
    manager
        .reload_policy()
        .await
        .context("loading policy history")?;

    match cli.command {
        Commands::Run => {
            manager.start().await;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            info!("Shutting down...");
            manager.stop().await?;
        }
        Commands::Once => {
            manager.run_once().await?;
            print_json(&manager.status().await)?;
        }
        Commands::Status => {
            manager.queue_health().await?;
            let metrics = manager.metrics().await?;
            print_json(&serde_json::json!({
                "status": manager.status().await,
                "metrics": metrics,
            }))?;
        }
        Commands::Scan => {
            let upserted = memory.scan_for_duplicates().await?;
            print_json(&serde_json::json!({ "suggestions_upserted": upserted }))?;
        }
        Commands::Rollback { policy_key } => {
            let change = manager.rollback_policy(&policy_key).await?;
            print_json(&change)?;
        }
        Commands::Retry { job_id } => {
            manager.retry_job(job_id).await?;
            print_json(&serde_json::json!({ "job_id": job_id, "status": "queued" }))?;
        }
        Commands::Cancel { job_id } => {
            manager.cancel_job(job_id).await?;
            print_json(&serde_json::json!({ "job_id": job_id, "status": "cancelled" }))?;
        }
        Commands::Runs {
            status,
            job_type,
            limit,
        } => {
            let runs = manager
                .list_runs(RunFilters {
                    status,
                    job_type,
                    limit,
                    ..Default::default()
                })
                .await?;
            print_json(&runs)?;
        }
        Commands::Events { job_id, limit } => {
            let events = manager.list_events(job_id, limit, 0).await?;
            print_json(&events)?;
        }
    }

    Ok(())
}
