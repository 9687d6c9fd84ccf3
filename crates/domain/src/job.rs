use murmur_core::AppResult;
use serde::{Deserialize, Serialize};

use crate::lock::LockKey;

/// Periodic background job that must run on exactly one replica per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledJobKind {
    /// Sweeps pending webhook deliveries.
    WebhookDispatch,
    /// Rolls up AI token usage per project.
    UsageAggregation,
    /// Refreshes feedback statistics snapshots.
    StatisticsRefresh,
}

impl ScheduledJobKind {
    /// Every job kind, in scheduling order.
    pub const ALL: [Self; 3] = [
        Self::WebhookDispatch,
        Self::UsageAggregation,
        Self::StatisticsRefresh,
    ];

    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebhookDispatch => "webhook_dispatch",
            Self::UsageAggregation => "usage_aggregation",
            Self::StatisticsRefresh => "statistics_refresh",
        }
    }

    /// Returns the lock key guarding this job.
    pub fn lock_key(&self) -> AppResult<LockKey> {
        LockKey::new(format!("job:{}", self.as_str()))
    }

    /// Returns the upper-case prefix used for per-job environment variables.
    #[must_use]
    pub fn env_prefix(&self) -> String {
        format!("JOB_{}", self.as_str().to_ascii_uppercase())
    }

    /// Returns the default tick interval in milliseconds.
    #[must_use]
    pub fn default_interval_ms(&self) -> u64 {
        match self {
            Self::WebhookDispatch => 15_000,
            Self::UsageAggregation => 300_000,
            Self::StatisticsRefresh => 60_000,
        }
    }

    /// Returns the default lease length in milliseconds.
    #[must_use]
    pub fn default_lease_ms(&self) -> u64 {
        match self {
            Self::WebhookDispatch => 60_000,
            Self::UsageAggregation => 600_000,
            Self::StatisticsRefresh => 180_000,
        }
    }
}

impl std::fmt::Display for ScheduledJobKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}
