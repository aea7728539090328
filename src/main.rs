// =============================================================================
// Aurora Collector — Main Entry Point
// =============================================================================
//
// Runs one batch of collection tasks (historical backfills and live streams)
// from the JSON file named by AURORA_BATCH_CONFIG, then exits with:
//
//   0  every task succeeded (or stopped cleanly on Ctrl-C)
//   1  at least one task failed
//   2  the batch configuration could not be loaded or validated
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod backoff;
mod clock;
mod context;
mod error;
mod fetcher;
mod ledger;
mod pipeline;
mod provider;
mod runner;
mod runtime_config;
mod sink;
mod supervisor;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::clock::SystemClock;
use crate::context::RunContext;
use crate::runner::BatchRunner;
use crate::runtime_config::{
    task_filter, BatchConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH, TASK_FILTER_ENV,
};

const EXIT_BAD_CONFIG: i32 = 2;

#[tokio::main]
async fn main() {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Collector — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Batch configuration ───────────────────────────────────────────
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut batch = match BatchConfig::load(&path) {
        Ok(b) => b,
        Err(e) => {
            error!(path = %path, error = %format!("{e:#}"), "batch config rejected");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };

    let selection = task_filter(std::env::var(TASK_FILTER_ENV).ok().as_deref());
    if let Err(e) = batch.select(&selection) {
        error!(filter = ?selection, error = %e, "task selection rejected");
        std::process::exit(EXIT_BAD_CONFIG);
    }
    if batch.tasks.is_empty() {
        warn!(path = %path, "no tasks to run");
    }

    // ── 3. Run context & shutdown signal ─────────────────────────────────
    let ctx = RunContext::new(Arc::new(SystemClock), batch.max_concurrent_fetches);

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown signal received — stopping gracefully");
            cancel.cancel();
        }
    });

    // ── 4. Run ───────────────────────────────────────────────────────────
    let runner = BatchRunner::new(ctx);
    let outcome = runner.run(&batch).await;

    let failed = outcome
        .reports
        .iter()
        .filter(|r| matches!(r.status, runner::TaskStatus::Failed(_)))
        .count();
    let code = outcome.exit_code();
    info!(
        tasks = outcome.reports.len(),
        failed,
        sink_close_errors = outcome.close_errors.len(),
        exit_code = code,
        "Aurora Collector shut down"
    );

    std::process::exit(code);
}
