//! Process-local lease lock store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use murmur_application::{LeaseClock, LeaseObservation, LockStore, SystemLeaseClock};
use murmur_core::AppResult;
use murmur_domain::{LeaseDuration, LockKey, LockRecord, ReplicaId};
use tokio::sync::Mutex;

/// In-memory lock store for single-process deployments and tests.
pub struct InMemoryLockStore {
    clock: Arc<dyn LeaseClock>,
    state: Mutex<InMemoryLockState>,
}

#[derive(Default)]
struct InMemoryLockState {
    rows: HashMap<String, LockRecord>,
    last_fencing_token: i64,
}

impl InMemoryLockStore {
    /// Creates an empty store driven by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemLeaseClock))
    }

    /// Creates an empty store driven by `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn LeaseClock>) -> Self {
        Self {
            clock,
            state: Mutex::new(InMemoryLockState::default()),
        }
    }
}

impl Default for InMemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn acquire_lease(
        &self,
        lock_key: &LockKey,
        holder_id: &ReplicaId,
        lease: LeaseDuration,
    ) -> AppResult<LeaseObservation> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let existing = state.rows.get(lock_key.as_str());
        let admitted = existing.is_none_or(|record| record.admits(holder_id, now));
        let renewed = existing
            .filter(|record| record.is_held_by(holder_id, now))
            .map(|record| (record.acquired_at(), record.fencing_token()));

        if admitted {
            let (acquired_at, fencing_token) = match renewed {
                Some(grant) => grant,
                None => {
                    state.last_fencing_token += 1;
                    (now, state.last_fencing_token)
                }
            };
            state.rows.insert(
                lock_key.as_str().to_owned(),
                LockRecord::new(
                    lock_key.clone(),
                    holder_id.clone(),
                    acquired_at,
                    lease.expiry_from(now),
                    fencing_token,
                ),
            );
        }

        Ok(LeaseObservation {
            record: state.rows.get(lock_key.as_str()).cloned(),
            observed_at: now,
        })
    }

    async fn release_lease(&self, lock_key: &LockKey, holder_id: &ReplicaId) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        let held = state
            .rows
            .get(lock_key.as_str())
            .is_some_and(|record| record.holder_id() == holder_id);

        if held {
            state.rows.remove(lock_key.as_str());
        }

        Ok(held)
    }
}
