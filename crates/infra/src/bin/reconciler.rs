//! Periodic reconciliation sweep against the Postgres job store and Redis broker.
//!
//! Reads the same environment as the workers (`DATABASE_URL`, `REDIS_URL`,
//! `CALLPIPE_RECONCILE_GRACE_MS`, ...). `--once` runs a single sweep and exits.

use std::thread;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use callpipe_infra::broker::RedisBroker;
use callpipe_infra::config::PipelineConfig;
use callpipe_infra::reconcile::Reconciler;
use callpipe_infra::store::PostgresJobStore;

fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().context("loading configuration")?;
    callpipe_observability::init(&config.service_name);

    let once = std::env::args().any(|a| a == "--once");
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set for the reconciler")?;
    let redis_url = config
        .redis_url
        .clone()
        .context("REDIS_URL must be set for the reconciler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let pool = runtime
        .block_on(PgPoolOptions::new().max_connections(2).connect(&database_url))
        .context("connecting to Postgres")?;
    let store = PostgresJobStore::new(pool, runtime.handle().clone());
    runtime
        .block_on(store.ensure_schema())
        .context("preparing schema")?;
    let broker = RedisBroker::new(&redis_url, None).context("connecting to Redis")?;

    let reconciler = Reconciler::new(store, broker, config.reconcile_grace);
    // Sweep a few times per grace period so nothing waits much longer than it.
    let interval = (config.reconcile_grace / 4).max(Duration::from_secs(1));
    info!(grace_ms = config.reconcile_grace.as_millis() as u64, "reconciler started");

    loop {
        match reconciler.sweep() {
            Ok(report) => info!(
                requeued = report.requeued,
                failed = report.failed,
                skipped = report.skipped,
                "sweep done"
            ),
            Err(e) => error!(error = %e, "sweep failed"),
        }
        if once {
            return Ok(());
        }
        thread::sleep(interval);
    }
}
