use std::sync::Arc;
use std::time::Duration;

use murmur_application::{AcquireOutcome, LockCoordinator, LockStore, ReleaseOutcome};
use murmur_domain::{LeaseDuration, LockKey, ReplicaId};
use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinSet;

use super::PostgresLockStore;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

async fn test_pool() -> Option<PgPool> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        return None;
    };

    let pool = match PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url.as_str())
        .await
    {
        Ok(pool) => pool,
        Err(error) => panic!("failed to connect to DATABASE_URL in test: {error}"),
    };

    if let Err(error) = MIGRATOR.run(&pool).await {
        panic!("failed to run migrations for postgres lock store tests: {error}");
    }

    Some(pool)
}

fn unique_key() -> LockKey {
    LockKey::new(format!("test:{}", uuid::Uuid::new_v4())).unwrap_or_else(|_| unreachable!())
}

fn replica(value: &str) -> ReplicaId {
    ReplicaId::new(value).unwrap_or_else(|_| unreachable!())
}

fn lease(millis: u64) -> LeaseDuration {
    LeaseDuration::from_millis(millis).unwrap_or_else(|_| unreachable!())
}

fn coordinator(pool: &PgPool, holder: &str) -> LockCoordinator {
    LockCoordinator::new(
        Arc::new(PostgresLockStore::new(pool.clone())),
        replica(holder),
    )
}

#[tokio::test]
async fn first_acquire_inserts_row_and_competitor_is_denied() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let key = unique_key();
    let replica_a = coordinator(&pool, "replica-a");
    let replica_b = coordinator(&pool, "replica-b");

    assert!(replica_a.acquire(&key, lease(30_000)).await);

    let denied = replica_b.try_acquire(&key, lease(30_000)).await;
    assert!(matches!(
        denied,
        AcquireOutcome::Denied {
            current_holder: Some(ref holder),
            ..
        } if holder.as_str() == "replica-a"
    ));

    let holder_id: Option<String> =
        sqlx::query_scalar("SELECT holder_id FROM distributed_locks WHERE lock_type = $1")
            .bind(key.as_str())
            .fetch_optional(&pool)
            .await
            .unwrap_or_default();
    assert_eq!(holder_id.as_deref(), Some("replica-a"));
}

#[tokio::test]
async fn renewal_keeps_fencing_token_and_extends_expiry() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let key = unique_key();
    let replica_a = coordinator(&pool, "replica-a");

    let first = replica_a.try_acquire(&key, lease(30_000)).await;
    let renewed = replica_a.try_acquire(&key, lease(60_000)).await;

    let first = first.grant().cloned();
    let renewed = renewed.grant().cloned();
    assert!(first.is_some());
    assert!(renewed.is_some());
    let (first, renewed) = (
        first.unwrap_or_else(|| unreachable!()),
        renewed.unwrap_or_else(|| unreachable!()),
    );
    assert_eq!(first.fencing_token, renewed.fencing_token);
    assert!(renewed.lease_expiry > first.lease_expiry);
}

#[tokio::test]
async fn expired_lease_is_taken_over_with_larger_fencing_token() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let key = unique_key();
    let replica_a = coordinator(&pool, "replica-a");
    let replica_b = coordinator(&pool, "replica-b");

    let first = replica_a.try_acquire(&key, lease(5)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let takeover = replica_b.try_acquire(&key, lease(30_000)).await;

    assert!(takeover.is_acquired());
    let first_token = first.grant().map(|grant| grant.fencing_token);
    let takeover_token = takeover.grant().map(|grant| grant.fencing_token);
    assert!(takeover_token > first_token);
}

#[tokio::test]
async fn release_is_conditional_on_holder() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let key = unique_key();
    let replica_a = coordinator(&pool, "replica-a");
    let replica_b = coordinator(&pool, "replica-b");

    assert!(replica_a.acquire(&key, lease(30_000)).await);
    assert_eq!(replica_b.release(&key).await, ReleaseOutcome::NotHeld);
    assert!(replica_a.acquire(&key, lease(30_000)).await);
    assert_eq!(replica_a.release(&key).await, ReleaseOutcome::Released);
    assert!(replica_b.acquire(&key, lease(30_000)).await);
}

#[tokio::test]
async fn concurrent_first_acquires_elect_one_holder() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let key = unique_key();
    let mut tasks = JoinSet::new();
    for index in 0..8 {
        let replica = coordinator(&pool, format!("replica-{index}").as_str());
        let key = key.clone();
        tasks.spawn(async move { replica.acquire(&key, lease(30_000)).await });
    }

    let mut winners = 0;
    while let Some(result) = tasks.join_next().await {
        if result.unwrap_or(false) {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
}

#[tokio::test]
async fn concurrent_takeovers_of_expired_lease_elect_one_holder() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let key = unique_key();
    let seeded = coordinator(&pool, "replica-crashed")
        .try_acquire(&key, lease(5))
        .await;
    assert!(seeded.is_acquired());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut tasks = JoinSet::new();
    for index in 0..8 {
        let replica = coordinator(&pool, format!("replica-{index}").as_str());
        let key = key.clone();
        tasks.spawn(async move { replica.try_acquire(&key, lease(30_000)).await });
    }

    let mut outcomes = Vec::new();
    while let Some(result) = tasks.join_next().await {
        outcomes.push(result.unwrap_or_else(|_| unreachable!()));
    }

    let winners: Vec<_> = outcomes.iter().filter_map(AcquireOutcome::grant).collect();
    assert_eq!(winners.len(), 1);
    assert!(
        winners[0].fencing_token > seeded.grant().map_or(0, |grant| grant.fencing_token)
    );
    assert!(
        outcomes
            .iter()
            .filter(|outcome| !outcome.is_acquired())
            .all(|outcome| matches!(outcome, AcquireOutcome::Denied { .. }))
    );

    let holder_id: Option<String> =
        sqlx::query_scalar("SELECT holder_id FROM distributed_locks WHERE lock_type = $1")
            .bind(key.as_str())
            .fetch_optional(&pool)
            .await
            .unwrap_or_default();
    assert_eq!(holder_id.as_deref(), Some(winners[0].holder_id.as_str()));
}

#[tokio::test]
async fn takeover_resets_acquisition_time_but_renewal_keeps_it() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let store = PostgresLockStore::new(pool);
    let key = unique_key();
    let holder = replica("replica-a");

    let first = store
        .acquire_lease(&key, &holder, lease(30_000))
        .await
        .unwrap_or_else(|_| unreachable!());
    let renewed = store
        .acquire_lease(&key, &holder, lease(30_000))
        .await
        .unwrap_or_else(|_| unreachable!());

    let first_record = first.record.unwrap_or_else(|| unreachable!());
    let renewed_record = renewed.record.unwrap_or_else(|| unreachable!());
    assert!(first_record.is_new_grant_at(first.observed_at));
    assert!(!renewed_record.is_new_grant_at(renewed.observed_at));
    assert_eq!(renewed_record.acquired_at(), first_record.acquired_at());
}

#[tokio::test]
async fn store_reports_observation_time_from_server_clock() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let store = PostgresLockStore::new(pool);
    let observation = store
        .acquire_lease(&unique_key(), &replica("replica-a"), lease(1_000))
        .await;

    assert!(observation.is_ok());
    let observation = observation.unwrap_or_else(|_| unreachable!());
    let record = observation.record.unwrap_or_else(|| unreachable!());
    assert_eq!(
        record.lease_expiry() - observation.observed_at,
        chrono::TimeDelta::milliseconds(1_000)
    );
}
