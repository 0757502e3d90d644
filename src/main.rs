// src/main.rs
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

use enrichment_lib::matching::reference::{ReferenceMatcher, DEFAULT_FUZZY_THRESHOLD};
use enrichment_lib::matching::timeout::TimeoutMatcher;
use enrichment_lib::matching::Matcher;
use enrichment_lib::pipeline::stages::{build_default_stages, default_descriptors, DEFAULT_STAGE_KEYS};
use enrichment_lib::pipeline::{
    PendingTracker, PipelineOrchestrator, PipelineSupervisor, ScanOutcome, StallWatchdog,
};
use enrichment_lib::models::BatchStatus;
use enrichment_lib::store::{PgRecordStore, SharedStore};
use enrichment_lib::utils::db_connect::{connect, get_pool_status, PgPool};
use enrichment_lib::utils::env::{env_or, load_env};
use enrichment_lib::utils::get_memory_usage;
use enrichment_lib::utils::pipeline_config::PipelineConfig;
use enrichment_lib::utils::progress_bars::progress_config::ProgressConfig;

#[derive(Parser)]
#[command(author, version, about = "Payee batch enrichment pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline over the given batches, then exit
    Run {
        /// Batch ids to process, in order
        #[arg(long = "batch", required = true)]
        batches: Vec<String>,
    },
    /// Keep running: pick up pending batches and watch for stalls until Ctrl-C
    Serve {
        /// Seconds between polls for pending batches
        #[arg(long, default_value_t = 10)]
        poll_secs: u64,
    },
    /// Run the stall watchdog
    Watchdog {
        /// Scan once and exit
        #[arg(long)]
        once: bool,
    },
}

struct Runtime {
    pool: PgPool,
    store: SharedStore,
    config: PipelineConfig,
    progress: ProgressConfig,
}

async fn build_runtime() -> Result<Runtime> {
    let config = PipelineConfig::from_env(&DEFAULT_STAGE_KEYS).context("Invalid pipeline configuration")?;
    config.log_config();

    let progress = ProgressConfig::from_env();
    info!(
        "Progress tracking: enabled={}, detailed={}",
        progress.enabled, progress.detailed
    );

    let pool = connect().await.context("Failed to connect to database")?;
    let (connections, idle, in_use) = get_pool_status(&pool);
    info!("DB pool: {} connections ({} idle, {} in use)", connections, idle, in_use);

    let pg_store = PgRecordStore::new(pool.clone(), default_descriptors(&config))
        .context("Failed to build record store")?;
    pg_store.ensure_schema().await?;

    Ok(Runtime {
        pool,
        store: Arc::new(pg_store),
        config,
        progress,
    })
}

async fn build_orchestrator(runtime: &Runtime) -> Result<PipelineOrchestrator> {
    let threshold = env_or("MATCHER_FUZZY_THRESHOLD", DEFAULT_FUZZY_THRESHOLD);
    let reference = ReferenceMatcher::load(&runtime.pool, threshold)
        .await
        .context("Failed to load reference suppliers")?;
    if reference.is_empty() {
        warn!("Reference supplier table is empty; supplier matching will match nothing");
    }

    let mut matcher: Arc<dyn Matcher> = Arc::new(reference);
    let timeout_ms = env_or("MATCHER_TIMEOUT_MS", 0u64);
    if timeout_ms > 0 {
        matcher = Arc::new(TimeoutMatcher::new(matcher, Duration::from_millis(timeout_ms)));
    }

    let multi_progress = if runtime.progress.should_show_detailed() {
        runtime.progress.create_multi_progress()
    } else {
        None
    };
    let stages = build_default_stages(runtime.store.clone(), matcher, &runtime.config, multi_progress);
    Ok(PipelineOrchestrator::new(
        runtime.store.clone(),
        stages,
        runtime.config.clone(),
    ))
}

async fn run_batches(runtime: &Runtime, batches: &[String]) -> Result<()> {
    let orchestrator = build_orchestrator(runtime).await?;
    let start = Instant::now();
    let mut failed = 0;

    for batch_id in batches {
        let outcome = orchestrator
            .run(batch_id)
            .await
            .with_context(|| format!("Failed to run batch {}", batch_id))?;
        if outcome.status != BatchStatus::Completed {
            failed += 1;
        }
        if runtime.progress.should_show_memory() {
            info!("Memory in use: {} MB", get_memory_usage().await);
        }
    }

    info!(
        "Processed {} batches in {:.2?} ({} did not complete)",
        batches.len(),
        start.elapsed(),
        failed
    );
    Ok(())
}

async fn serve(runtime: &Runtime, poll_secs: u64) -> Result<()> {
    let orchestrator = Arc::new(build_orchestrator(runtime).await?);
    let watchdog = Arc::new(StallWatchdog::new(
        runtime.store.clone(),
        runtime.config.watchdog.clone(),
    ));
    let handle = PipelineSupervisor::new(orchestrator, watchdog).start();

    let mut tracker = PendingTracker::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(poll_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match runtime.store.list_pending_batches().await {
                    Ok(pending) => {
                        for batch_id in tracker.newly_pending(pending.iter().map(|b| b.id.as_str())) {
                            info!("Queueing pending batch {}", batch_id);
                            handle.submit(&batch_id).await?;
                        }
                    }
                    Err(e) => warn!("Could not list pending batches, retrying next poll: {:#}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested, draining queued batches");
                break;
            }
        }
    }

    let processed = handle.stop().await?;
    info!("Served {} batches", processed);
    Ok(())
}

async fn watch(runtime: &Runtime, once: bool) -> Result<()> {
    let watchdog = StallWatchdog::new(runtime.store.clone(), runtime.config.watchdog.clone());
    if once {
        match watchdog.scan().await {
            ScanOutcome::Scanned { inspected, stalled } => {
                for report in &stalled {
                    warn!("{} fault on batch {}: {}", report.kind(), report.batch_id, report.message);
                }
                info!("Inspected {} active batches, {} marked stalled", inspected, stalled.len());
            }
            ScanOutcome::StoreUnavailable { reason } => {
                anyhow::bail!("record store unavailable: {}", reason);
            }
        }
        return Ok(());
    }

    let (shutdown, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(async move { watchdog.run(shutdown_rx).await });
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    let _ = shutdown.send(true);
    task.await.context("watchdog task failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    load_env();
    let cli = Cli::parse();
    info!("Starting payee enrichment pipeline");

    let runtime = build_runtime().await?;
    match cli.command {
        Command::Run { batches } => run_batches(&runtime, &batches).await,
        Command::Serve { poll_secs } => serve(&runtime, poll_secs).await,
        Command::Watchdog { once } => watch(&runtime, once).await,
    }
}
