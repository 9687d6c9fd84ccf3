//! Per-tick execution of single-runner jobs.

use std::time::{Duration, Instant};

use murmur_domain::LeaseDuration;
use tracing::{info, warn};

use crate::job_ports::{JobSchedule, ReleasePolicy, ScheduledJob};
use crate::lock_coordinator::{AcquireOutcome, LeaseGrant, LockCoordinator, ReleaseOutcome};


/// Lease state handed to a job body while it runs.
pub struct JobContext {
    coordinator: LockCoordinator,
    grant: LeaseGrant,
    lease: LeaseDuration,
    granted_at: Instant,
}

impl JobContext {
    /// Returns the grant currently backing this tick.
    #[must_use]
    pub fn grant(&self) -> &LeaseGrant {
        &self.grant
    }

    /// Returns the fencing token to attach to downstream writes.
    #[must_use]
    pub fn fencing_token(&self) -> i64 {
        self.grant.fencing_token
    }

    /// Extends the lease for another full duration.
    ///
    /// Returns false when the lease was lost or the store was unreachable;
    /// the body should stop writing in that case.
    pub async fn renew_lease(&mut self) -> bool {
        let requested_at = Instant::now();
        match self
            .coordinator
            .try_acquire(&self.grant.lock_key, self.lease)
            .await
        {
            AcquireOutcome::Acquired(grant) => {
                if grant.fencing_token != self.grant.fencing_token {
                    warn!(
                        lock_type = %grant.lock_key,
                        previous_token = self.grant.fencing_token,
                        fencing_token = grant.fencing_token,
                        "lease lapsed before renewal and was re-acquired"
                    );
                }
                self.grant = grant;
                self.granted_at = requested_at;
                true
            }
            AcquireOutcome::Denied { .. } | AcquireOutcome::Unavailable { .. } => false,
        }
    }

    /// Time since the last successful grant or renewal, once it reaches the
    /// lease length.
    fn lease_overrun(&self) -> Option<Duration> {
        let held = self.granted_at.elapsed();
        (held >= self.lease.as_std()).then_some(held)
    }
}

/// Outcome of one scheduling tick on this replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another replica holds the lease or the store was unreachable.
    Skipped,
    /// The job body ran to completion.
    Completed {
        /// Fencing token of the grant the body ran under.
        fencing_token: i64,
    },
    /// The job body returned an error.
    Failed {
        /// Error reported by the body.
        error: String,
    },
}

/// Runs job bodies behind the distributed lease lock.
#[derive(Clone)]
pub struct JobRunner {
    coordinator: LockCoordinator,
}

impl JobRunner {
    /// Creates a runner backed by `coordinator`.
    #[must_use]
    pub fn new(coordinator: LockCoordinator) -> Self {
        Self { coordinator }
    }

    /// Executes one tick: acquire, run the body, then apply the release policy.
    pub async fn run_tick(&self, job: &dyn ScheduledJob, schedule: &JobSchedule) -> TickOutcome {
        let requested_at = Instant::now();
        let grant = match self
            .coordinator
            .try_acquire(schedule.lock_key(), schedule.lease())
            .await
        {
            AcquireOutcome::Acquired(grant) => grant,
            AcquireOutcome::Denied { .. } | AcquireOutcome::Unavailable { .. } => {
                return TickOutcome::Skipped;
            }
        };

        let started = Instant::now();
        let mut context = JobContext {
            coordinator: self.coordinator.clone(),
            grant,
            lease: schedule.lease(),
            granted_at: requested_at,
        };
        let result = job.run(&mut context).await;
        let elapsed = started.elapsed();

        if let Some(held) = context.lease_overrun() {
            warn!(
                job = %schedule.kind(),
                holder_id = %self.coordinator.holder_id(),
                held_ms = held.as_millis(),
                lease_ms = schedule.lease().as_millis(),
                "job outlived its lease without renewing; another replica may have started it"
            );
        }

        let outcome = match result {
            Ok(()) => {
                info!(
                    job = %schedule.kind(),
                    holder_id = %self.coordinator.holder_id(),
                    fencing_token = context.fencing_token(),
                    elapsed_ms = elapsed.as_millis(),
                    "scheduled job completed"
                );
                TickOutcome::Completed {
                    fencing_token: context.fencing_token(),
                }
            }
            Err(error) => {
                warn!(
                    job = %schedule.kind(),
                    holder_id = %self.coordinator.holder_id(),
                    fencing_token = context.fencing_token(),
                    error = %error,
                    "scheduled job failed"
                );
                TickOutcome::Failed {
                    error: error.to_string(),
                }
            }
        };

        if schedule.release_policy() == ReleasePolicy::ReleaseOnCompletion {
            self.coordinator.release(schedule.lock_key()).await;
        }

        outcome
    }

    /// Releases the job's lease regardless of its policy, for shutdown.
    pub async fn relinquish(&self, schedule: &JobSchedule) -> ReleaseOutcome {
        self.coordinator.release(schedule.lock_key()).await
    }
}
