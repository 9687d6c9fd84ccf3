//! Murmur scheduled-job worker runtime.
//!
//! Every replica runs one tick loop per enabled job. Before each tick the
//! replica competes for the job's lease in the shared lock store; only the
//! winner triggers the job body.

#![forbid(unsafe_code)]

mod worker_config;

use std::sync::Arc;
use std::time::Duration;

use murmur_application::{
    JobRunner, JobSchedule, LockCoordinator, LockStore, ScheduledJob, TickOutcome,
};
use murmur_core::{AppError, AppResult};
use murmur_infrastructure::{HttpScheduledJob, InMemoryLockStore, PostgresLockStore};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::worker_config::{LockStoreBackend, WorkerConfig};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let lock_store = build_lock_store(&config.lock_store).await?;
    let runner = JobRunner::new(LockCoordinator::new(
        lock_store,
        config.replica_id.clone(),
    ));
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|error| AppError::Internal(format!("failed to build HTTP client: {error}")))?;

    info!(
        replica_id = %config.replica_id,
        api_base_url = %config.api_base_url,
        scheduled_jobs = config.schedules.len(),
        "murmur-worker started"
    );

    let (shutdown_sender, shutdown_receiver) = watch::channel(false);
    let mut tick_loops = JoinSet::new();

    for schedule in config.schedules.iter().cloned() {
        let job: Arc<dyn ScheduledJob> = Arc::new(HttpScheduledJob::new(
            http_client.clone(),
            config.api_base_url.as_str(),
            config.worker_shared_secret.clone(),
            schedule.kind(),
            config.replica_id.clone(),
            config.max_batches_per_tick,
        ));

        info!(
            job = %schedule.kind(),
            interval_ms = schedule.interval().as_millis(),
            lease_ms = schedule.lease().as_millis(),
            release_policy = schedule.release_policy().as_str(),
            "scheduling job"
        );

        tick_loops.spawn(run_tick_loop(
            runner.clone(),
            job,
            schedule,
            shutdown_receiver.clone(),
        ));
    }

    if tick_loops.is_empty() {
        warn!(replica_id = %config.replica_id, "no jobs enabled, exiting");
        return Ok(());
    }

    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for shutdown signal");
    }

    info!(replica_id = %config.replica_id, "shutting down, releasing held leases");
    let _ = shutdown_sender.send(true);

    while let Some(result) = tick_loops.join_next().await {
        if let Err(error) = result {
            warn!(error = %error, "job tick loop terminated abnormally");
        }
    }

    Ok(())
}

async fn run_tick_loop(
    runner: JobRunner,
    job: Arc<dyn ScheduledJob>,
    schedule: JobSchedule,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(schedule.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if runner.run_tick(job.as_ref(), &schedule).await == TickOutcome::Skipped {
                    debug!(job = %schedule.kind(), "tick skipped");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let outcome = runner.relinquish(&schedule).await;
    debug!(job = %schedule.kind(), outcome = ?outcome, "tick loop stopped");
}

async fn build_lock_store(backend: &LockStoreBackend) -> AppResult<Arc<dyn LockStore>> {
    match backend {
        LockStoreBackend::Postgres {
            database_url,
            max_connections,
        } => {
            let pool = connect_and_migrate(database_url.as_str(), *max_connections).await?;
            Ok(Arc::new(PostgresLockStore::new(pool)))
        }
        LockStoreBackend::Memory => {
            warn!("using in-memory lock store; jobs are not coordinated across replicas");
            Ok(Arc::new(InMemoryLockStore::new()))
        }
    }
}

async fn connect_and_migrate(database_url: &str, max_connections: u32) -> AppResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))?;

    sqlx::migrate!("../../crates/infrastructure/migrations")
        .run(&pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to run migrations: {error}")))?;

    Ok(pool)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
