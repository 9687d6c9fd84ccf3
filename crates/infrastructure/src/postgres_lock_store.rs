//! PostgreSQL-backed lease lock store using the `distributed_locks` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use murmur_application::{LeaseObservation, LockStore};
use murmur_core::{AppError, AppResult};
use murmur_domain::{LeaseDuration, LockKey, LockRecord, ReplicaId};

#[cfg(test)]
mod tests;

/// PostgreSQL implementation of the lock store port.
#[derive(Clone)]
pub struct PostgresLockStore {
    pool: PgPool,
}

impl PostgresLockStore {
    /// Creates a store with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct LeaseObservationRow {
    observed_at: DateTime<Utc>,
    lock_type: Option<String>,
    holder_id: Option<String>,
    acquired_at: Option<DateTime<Utc>>,
    lease_expiry: Option<DateTime<Utc>>,
    fencing_token: Option<i64>,
}

impl LeaseObservationRow {
    fn into_observation(self) -> AppResult<LeaseObservation> {
        let record = match (
            self.lock_type,
            self.holder_id,
            self.acquired_at,
            self.lease_expiry,
            self.fencing_token,
        ) {
            (
                Some(lock_type),
                Some(holder_id),
                Some(acquired_at),
                Some(lease_expiry),
                Some(fencing_token),
            ) => {
                let lock_key = LockKey::new(lock_type).map_err(|error| {
                    AppError::Internal(format!("invalid persisted lock type: {error}"))
                })?;
                let holder_id = ReplicaId::new(holder_id).map_err(|error| {
                    AppError::Internal(format!("invalid persisted lock holder: {error}"))
                })?;
                Some(LockRecord::new(
                    lock_key,
                    holder_id,
                    acquired_at,
                    lease_expiry,
                    fencing_token,
                ))
            }
            (None, None, None, None, None) => None,
            _ => {
                return Err(AppError::Internal(
                    "partially populated lock read-back row".to_owned(),
                ));
            }
        };

        Ok(LeaseObservation {
            record,
            observed_at: self.observed_at,
        })
    }
}

#[async_trait]
impl LockStore for PostgresLockStore {
    async fn acquire_lease(
        &self,
        lock_key: &LockKey,
        holder_id: &ReplicaId,
        lease: LeaseDuration,
    ) -> AppResult<LeaseObservation> {
        let lease_ms = i64::try_from(lease.as_millis()).map_err(|error| {
            AppError::Validation(format!("invalid lease duration: {error}"))
        })?;

        // Conditional upsert and read-back in one statement, timed by the
        // server's now(). When the update branch is skipped the fallback
        // SELECT reads the statement snapshot, so a row committed concurrently
        // is either invisible or stale and is reported as denied.
        let row = sqlx::query_as::<_, LeaseObservationRow>(
            r#"
            WITH acquired AS (
                INSERT INTO distributed_locks AS locks (
                    lock_type,
                    holder_id,
                    lease_expiry,
                    fencing_token,
                    acquired_at,
                    updated_at
                )
                VALUES (
                    $1,
                    $2,
                    now() + ($3::BIGINT * INTERVAL '1 millisecond'),
                    nextval('distributed_lock_fencing_tokens'),
                    now(),
                    now()
                )
                ON CONFLICT (lock_type) DO UPDATE
                SET
                    holder_id = EXCLUDED.holder_id,
                    lease_expiry = EXCLUDED.lease_expiry,
                    fencing_token = CASE
                        WHEN locks.holder_id = EXCLUDED.holder_id AND locks.lease_expiry > now()
                        THEN locks.fencing_token
                        ELSE EXCLUDED.fencing_token
                    END,
                    acquired_at = CASE
                        WHEN locks.holder_id = EXCLUDED.holder_id AND locks.lease_expiry > now()
                        THEN locks.acquired_at
                        ELSE now()
                    END,
                    updated_at = now()
                WHERE locks.lease_expiry <= now()
                   OR locks.holder_id = EXCLUDED.holder_id
                RETURNING
                    locks.lock_type,
                    locks.holder_id,
                    locks.acquired_at,
                    locks.lease_expiry,
                    locks.fencing_token
            ),
            current_lock AS (
                SELECT lock_type, holder_id, acquired_at, lease_expiry, fencing_token
                FROM acquired
                UNION ALL
                SELECT lock_type, holder_id, acquired_at, lease_expiry, fencing_token
                FROM distributed_locks
                WHERE lock_type = $1
                  AND NOT EXISTS (SELECT 1 FROM acquired)
            )
            SELECT
                now() AS observed_at,
                current_lock.lock_type,
                current_lock.holder_id,
                current_lock.acquired_at,
                current_lock.lease_expiry,
                current_lock.fencing_token
            FROM (SELECT 1) AS probe
            LEFT JOIN current_lock ON TRUE
            "#,
        )
        .bind(lock_key.as_str())
        .bind(holder_id.as_str())
        .bind(lease_ms)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            AppError::Unavailable(format!(
                "failed to acquire lock '{lock_key}' for holder '{holder_id}': {error}"
            ))
        })?;

        row.into_observation()
    }

    async fn release_lease(&self, lock_key: &LockKey, holder_id: &ReplicaId) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM distributed_locks
            WHERE lock_type = $1
              AND holder_id = $2
            "#,
        )
        .bind(lock_key.as_str())
        .bind(holder_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Unavailable(format!(
                "failed to release lock '{lock_key}' for holder '{holder_id}': {error}"
            ))
        })?;

        Ok(result.rows_affected() > 0)
    }
}
