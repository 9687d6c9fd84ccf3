//! Lease-lock coordination for single-runner background jobs.
//!
//! Every replica constructs one [`LockCoordinator`] bound to its own
//! [`ReplicaId`]. `acquire` and `release` each issue exactly one call into the
//! [`LockStore`]; all failure modes fold into an outcome value so the caller's
//! only policy is "run the job" or "skip this tick".

use std::sync::Arc;

use chrono::{DateTime, Utc};
use murmur_domain::{LeaseDuration, LockKey, ReplicaId};
use tracing::{debug, info, warn};

use crate::lock_ports::LockStore;


/// Lease granted to this replica by one successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    /// Protected resource key.
    pub lock_key: LockKey,
    /// Holder identity recorded in the store.
    pub holder_id: ReplicaId,
    /// Store-clock instant the lease lapses.
    pub lease_expiry: DateTime<Utc>,
    /// Monotonic token that changes on every takeover and survives renewals.
    pub fencing_token: i64,
}

/// Result of one acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// This replica holds a valid lease.
    Acquired(LeaseGrant),
    /// Another replica holds a valid lease, or the read-back was not conclusive.
    Denied {
        /// Holder seen in the read-back, when one was visible.
        current_holder: Option<ReplicaId>,
        /// Expiry seen in the read-back, when one was visible.
        lease_expiry: Option<DateTime<Utc>>,
    },
    /// The store could not be reached; treated as not acquired.
    Unavailable {
        /// Store failure description.
        reason: String,
    },
}

impl AcquireOutcome {
    /// Returns true only when the lease was granted.
    #[must_use]
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    /// Returns the grant when the lease was acquired.
    #[must_use]
    pub fn grant(&self) -> Option<&LeaseGrant> {
        match self {
            Self::Acquired(grant) => Some(grant),
            Self::Denied { .. } | Self::Unavailable { .. } => None,
        }
    }
}

/// Result of one release attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The lease row held by this replica was removed.
    Released,
    /// This replica did not hold the lease; nothing changed.
    NotHeld,
    /// The store could not be reached; the lease will lapse on its own.
    Failed {
        /// Store failure description.
        reason: String,
    },
}

/// Acquires and releases leases on behalf of one replica.
#[derive(Clone)]
pub struct LockCoordinator {
    store: Arc<dyn LockStore>,
    holder_id: ReplicaId,
}

impl LockCoordinator {
    /// Creates a coordinator acting as `holder_id`.
    #[must_use]
    pub fn new(store: Arc<dyn LockStore>, holder_id: ReplicaId) -> Self {
        Self { store, holder_id }
    }

    /// Returns the replica identity used for every lease.
    #[must_use]
    pub fn holder_id(&self) -> &ReplicaId {
        &self.holder_id
    }

    /// Attempts to acquire or renew the lease for `lock_key`.
    ///
    /// Succeeds when no lease exists, the existing lease has expired, or this
    /// replica already holds it. Never waits for another holder.
    pub async fn try_acquire(&self, lock_key: &LockKey, lease: LeaseDuration) -> AcquireOutcome {
        let observation = match self
            .store
            .acquire_lease(lock_key, &self.holder_id, lease)
            .await
        {
            Ok(observation) => observation,
            Err(error) => {
                warn!(
                    lock_type = %lock_key,
                    holder_id = %self.holder_id,
                    error = %error,
                    "lock store unavailable during acquire"
                );
                return AcquireOutcome::Unavailable {
                    reason: error.to_string(),
                };
            }
        };

        let Some(record) = observation.record else {
            // A concurrent first insert committed after our statement snapshot.
            debug!(
                lock_type = %lock_key,
                holder_id = %self.holder_id,
                "lock row not visible after conditional write"
            );
            return AcquireOutcome::Denied {
                current_holder: None,
                lease_expiry: None,
            };
        };

        if record.holder_id() != &self.holder_id {
            debug!(
                lock_type = %lock_key,
                holder_id = %self.holder_id,
                current_holder = %record.holder_id(),
                lease_expiry = %record.lease_expiry(),
                "lock held by another replica"
            );
            return AcquireOutcome::Denied {
                current_holder: Some(record.holder_id().clone()),
                lease_expiry: Some(record.lease_expiry()),
            };
        }

        if !record.is_valid_at(observation.observed_at) {
            warn!(
                lock_type = %lock_key,
                holder_id = %self.holder_id,
                lease_expiry = %record.lease_expiry(),
                observed_at = %observation.observed_at,
                "lock read-back shows an already expired lease"
            );
            return AcquireOutcome::Denied {
                current_holder: Some(record.holder_id().clone()),
                lease_expiry: Some(record.lease_expiry()),
            };
        }

        if record.is_new_grant_at(observation.observed_at) {
            info!(
                lock_type = %lock_key,
                holder_id = %self.holder_id,
                lease_ms = lease.as_millis(),
                fencing_token = record.fencing_token(),
                "lock acquired"
            );
        } else {
            debug!(
                lock_type = %lock_key,
                holder_id = %self.holder_id,
                lease_ms = lease.as_millis(),
                fencing_token = record.fencing_token(),
                "lock renewed"
            );
        }

        AcquireOutcome::Acquired(LeaseGrant {
            lock_key: record.lock_key().clone(),
            holder_id: record.holder_id().clone(),
            lease_expiry: record.lease_expiry(),
            fencing_token: record.fencing_token(),
        })
    }

    /// Attempts to acquire the lease and reports only whether it was granted.
    pub async fn acquire(&self, lock_key: &LockKey, lease: LeaseDuration) -> bool {
        self.try_acquire(lock_key, lease).await.is_acquired()
    }

    /// Releases the lease for `lock_key` if this replica holds it.
    pub async fn release(&self, lock_key: &LockKey) -> ReleaseOutcome {
        match self.store.release_lease(lock_key, &self.holder_id).await {
            Ok(true) => {
                debug!(
                    lock_type = %lock_key,
                    holder_id = %self.holder_id,
                    "lock released"
                );
                ReleaseOutcome::Released
            }
            Ok(false) => {
                debug!(
                    lock_type = %lock_key,
                    holder_id = %self.holder_id,
                    "release skipped, lock not held by this replica"
                );
                ReleaseOutcome::NotHeld
            }
            Err(error) => {
                warn!(
                    lock_type = %lock_key,
                    holder_id = %self.holder_id,
                    error = %error,
                    "lock store unavailable during release, lease will expire"
                );
                ReleaseOutcome::Failed {
                    reason: error.to_string(),
                }
            }
        }
    }
}
