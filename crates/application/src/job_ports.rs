use std::time::Duration;

use async_trait::async_trait;
use murmur_core::{AppError, AppResult};
use murmur_domain::{LeaseDuration, LockKey, ScheduledJobKind};

use crate::job_runner::JobContext;

/// Body of one periodic job, executed only by the replica holding its lease.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    /// Returns the job kind this body implements.
    fn kind(&self) -> ScheduledJobKind;

    /// Runs one tick of the job while the lease is held.
    async fn run(&self, context: &mut JobContext) -> AppResult<()>;
}

/// What a replica does with its lease once a tick finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Delete the lease so any replica may win the next tick.
    ReleaseOnCompletion,
    /// Keep the lease until it lapses; the holder renews on its next tick.
    HoldUntilExpiry,
}

impl ReleasePolicy {
    /// Returns stable configuration value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReleaseOnCompletion => "release",
            Self::HoldUntilExpiry => "hold",
        }
    }

    /// Parses configuration value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "release" => Ok(Self::ReleaseOnCompletion),
            "hold" => Ok(Self::HoldUntilExpiry),
            _ => Err(AppError::Validation(format!(
                "unknown release policy '{value}'"
            ))),
        }
    }
}

/// Scheduling parameters for one job on this replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSchedule {
    kind: ScheduledJobKind,
    lock_key: LockKey,
    interval: Duration,
    lease: LeaseDuration,
    release_policy: ReleasePolicy,
}

impl JobSchedule {
    /// Creates a validated job schedule.
    pub fn new(
        kind: ScheduledJobKind,
        interval_ms: u64,
        lease: LeaseDuration,
        release_policy: ReleasePolicy,
    ) -> AppResult<Self> {
        if interval_ms == 0 {
            return Err(AppError::Validation(format!(
                "tick interval for job '{kind}' must be greater than zero"
            )));
        }

        Ok(Self {
            kind,
            lock_key: kind.lock_key()?,
            interval: Duration::from_millis(interval_ms),
            lease,
            release_policy,
        })
    }

    /// Returns the scheduled job kind.
    #[must_use]
    pub fn kind(&self) -> ScheduledJobKind {
        self.kind
    }

    /// Returns the lock key guarding the job.
    #[must_use]
    pub fn lock_key(&self) -> &LockKey {
        &self.lock_key
    }

    /// Returns the tick interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the lease requested on each tick.
    #[must_use]
    pub fn lease(&self) -> LeaseDuration {
        self.lease
    }

    /// Returns what happens to the lease after a tick.
    #[must_use]
    pub fn release_policy(&self) -> ReleasePolicy {
        self.release_policy
    }
}
