use async_trait::async_trait;
use chrono::{DateTime, Utc};
use murmur_core::AppResult;
use murmur_domain::{LeaseDuration, LockKey, LockRecord, ReplicaId};

/// Durable arbitration point for lease locks.
///
/// Implementations own the clock: `now()` and the candidate expiry are
/// evaluated by the store, and the instant used is reported back in
/// [`LeaseObservation::observed_at`].
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Inserts a lease for `holder_id`, or overwrites the existing one when it
    /// has expired or already belongs to `holder_id`, then reads back the
    /// resulting row. Must complete as one atomic round trip.
    async fn acquire_lease(
        &self,
        lock_key: &LockKey,
        holder_id: &ReplicaId,
        lease: LeaseDuration,
    ) -> AppResult<LeaseObservation>;

    /// Deletes the lease only when `holder_id` is the recorded holder.
    ///
    /// Returns whether a row was removed.
    async fn release_lease(&self, lock_key: &LockKey, holder_id: &ReplicaId) -> AppResult<bool>;
}

/// Read-back of one lock row taken by the store during `acquire_lease`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseObservation {
    /// Row as seen after the conditional write, when visible.
    pub record: Option<LockRecord>,
    /// Store clock reading used for the write and the validity check.
    pub observed_at: DateTime<Utc>,
}

/// Time source for stores that keep lease state outside a database.
pub trait LeaseClock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation of [`LeaseClock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLeaseClock;

impl LeaseClock for SystemLeaseClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
