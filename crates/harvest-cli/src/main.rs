use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harvest_core::HarvestCheckpoint;
use harvest_store::{
    CheckpointStore, FailureLedger, FailureQuery, HarvestStore, MemoryStore, PgStore,
};
use harvest_sync::{
    build_runtime, maybe_build_scheduler, HarvestConfig, InvocationOutcome, StoreBackend,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Marketplace catalog harvester")]
struct Cli {
    /// Override HARVEST_STORE (postgres or memory).
    #[arg(long, global = true)]
    store: Option<StoreBackend>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One budget-limited harvest invocation.
    Run,
    /// Retry unrecovered failures through the slow path.
    Recover {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        min_failures: Option<u32>,
    },
    /// Failure ledger contents and statistics.
    Failures {
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Current checkpoint for the configured run type.
    Status,
    /// Run invocations on the configured cron until interrupted.
    Schedule,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = HarvestConfig::load()?;
    if let Some(store) = cli.store {
        config.store_backend = store;
    }
    let command = cli.command.unwrap_or(Commands::Run);

    match config.store_backend {
        StoreBackend::Postgres => {
            let timeout = Duration::from_secs(config.store_timeout_secs);
            let store = PgStore::connect(&config.database_url, timeout)
                .await
                .context("connecting to postgres")?
                .with_lookup_limit(config.lookup_chunk);
            if matches!(command, Commands::Migrate) {
                store.migrate().await.context("running migrations")?;
                println!("migrations applied");
                return Ok(());
            }
            execute(command, config, Arc::new(store)).await
        }
        StoreBackend::Memory => {
            warn!("memory store selected; nothing survives this process");
            execute(command, config, Arc::new(MemoryStore::new())).await
        }
    }
}

async fn execute<S: HarvestStore + 'static>(
    command: Commands,
    mut config: HarvestConfig,
    store: Arc<S>,
) -> Result<()> {
    match command {
        Commands::Run => {
            let runtime = build_runtime(&config, store)?;
            let summary = runtime.orchestrator.run_invocation().await;
            println!(
                "harvest {:?}: run_id={} batches={}/{} fetched={} failed={} new={} updated={} \
                 elapsed={:.1}s",
                summary.outcome,
                summary.run_id,
                summary.batches_processed.len(),
                summary.total_batches,
                summary.items_fetched,
                summary.items_failed,
                summary.documents_new,
                summary.documents_updated,
                summary.elapsed.as_secs_f64()
            );
            if let InvocationOutcome::Failed(reason) = &summary.outcome {
                warn!(%reason, "harvest invocation failed; recorded in the checkpoint");
            }
        }
        Commands::Recover { limit, min_failures } => {
            if let Some(limit) = limit {
                config.recovery_limit = limit;
            }
            if let Some(min) = min_failures {
                config.recovery_min_failures = min;
            }
            let runtime = build_runtime(&config, store)?;
            let summary = runtime.recovery.run().await?;
            runtime.rotator.log_summary();
            println!(
                "recovery complete: attempted={} recovered={} still_failing={}",
                summary.attempted, summary.recovered, summary.still_failing
            );
        }
        Commands::Failures { all, limit } => {
            let ledger = FailureLedger::new(store);
            let query = FailureQuery {
                only_unrecovered: !all,
                min_failure_count: if all { 0 } else { 1 },
                limit: Some(limit),
            };
            for record in ledger.records(&query).await? {
                println!(
                    "{}\t{}\tcount={}\tlast={}\t{}{}",
                    record.item_id,
                    record.reason,
                    record.failure_count,
                    record.last_failed_at.to_rfc3339(),
                    record.detail,
                    if record.is_recovered() { "\t(recovered)" } else { "" }
                );
            }
            let stats = ledger.statistics().await?;
            println!(
                "total={} unrecovered={} recovered={} by_reason={:?}",
                stats.total_failed, stats.unrecovered, stats.recovered, stats.by_reason
            );
        }
        Commands::Status => {
            let checkpoint = store.load_checkpoint(&config.run_type).await?;
            print_status(&config.run_type, checkpoint.as_ref());
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let runtime = build_runtime(&config, store)?;
            let scheduler = maybe_build_scheduler(&config, runtime.orchestrator.clone()).await?;
            let Some(sched) = scheduler else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutdown requested");
        }
        Commands::Migrate => {
            println!("migrations only apply to the postgres store");
        }
    }
    Ok(())
}

fn print_status(run_type: &str, checkpoint: Option<&HarvestCheckpoint>) {
    let Some(cp) = checkpoint else {
        println!("{run_type}: no checkpoint");
        return;
    };
    println!(
        "{run_type}: state={:?} in_progress={} batch={}/{} completed={} processed={} \
         last_error={} last_completion={}",
        cp.state,
        cp.is_in_progress,
        cp.current_batch_index,
        cp.total_batches,
        cp.completed_batches.len(),
        cp.processed_count,
        cp.last_error.as_deref().unwrap_or("-"),
        cp.last_successful_completion
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
}
