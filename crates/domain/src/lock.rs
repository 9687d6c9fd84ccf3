//! Distributed lock domain types.
//!
//! A lock record names one protected resource (`LockKey`), the replica that
//! currently holds its lease (`ReplicaId`) and the instant the lease lapses.
//! Holder and expiry only ever change together.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use murmur_core::{AppError, AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};

/// Maximum length accepted for lock keys and replica identifiers.
pub const LOCK_IDENTIFIER_MAX_LENGTH: usize = 200;

/// Longest lease any job may request.
pub const LEASE_DURATION_MAX_MS: u64 = 24 * 60 * 60 * 1000;

/// Opaque identifier of the resource protected by a lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey(NonEmptyString);

impl LockKey {
    /// Creates a validated lock key.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = validated_identifier("lock key", value.into())?;
        Ok(Self(value))
    }

    /// Returns the stored key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Identity of one running replica, used as the lease holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaId(NonEmptyString);

impl ReplicaId {
    /// Creates a validated replica identifier.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = validated_identifier("replica id", value.into())?;
        Ok(Self(value))
    }

    /// Returns the stored identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

fn validated_identifier(label: &str, value: String) -> AppResult<NonEmptyString> {
    let trimmed = value.trim();
    if trimmed.len() > LOCK_IDENTIFIER_MAX_LENGTH {
        return Err(AppError::Validation(format!(
            "{label} must be at most {LOCK_IDENTIFIER_MAX_LENGTH} characters"
        )));
    }

    NonEmptyString::new(trimmed.to_owned())
        .map_err(|_| AppError::Validation(format!("{label} must not be empty")))
}

/// Positive lease length in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LeaseDuration(u64);

impl LeaseDuration {
    /// Creates a validated lease duration.
    pub fn from_millis(millis: u64) -> AppResult<Self> {
        if millis == 0 {
            return Err(AppError::Validation(
                "lease duration must be greater than zero".to_owned(),
            ));
        }

        if millis > LEASE_DURATION_MAX_MS {
            return Err(AppError::Validation(format!(
                "lease duration must be at most {LEASE_DURATION_MAX_MS} ms"
            )));
        }

        Ok(Self(millis))
    }

    /// Returns the lease length in milliseconds.
    #[must_use]
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Returns the lease length as a standard duration.
    #[must_use]
    pub fn as_std(&self) -> Duration {
        Duration::from_millis(self.0)
    }

    /// Returns the lease length as a chrono delta.
    #[must_use]
    pub fn as_time_delta(&self) -> TimeDelta {
        // Bounded by LEASE_DURATION_MAX_MS at construction.
        TimeDelta::milliseconds(i64::try_from(self.0).unwrap_or(i64::MAX))
    }

    /// Returns the expiry of a lease granted at `granted_at`.
    #[must_use]
    pub fn expiry_from(&self, granted_at: DateTime<Utc>) -> DateTime<Utc> {
        granted_at + self.as_time_delta()
    }
}

/// Persisted lease state for one lock key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    lock_key: LockKey,
    holder_id: ReplicaId,
    acquired_at: DateTime<Utc>,
    lease_expiry: DateTime<Utc>,
    fencing_token: i64,
}

impl LockRecord {
    /// Creates a lock record.
    #[must_use]
    pub fn new(
        lock_key: LockKey,
        holder_id: ReplicaId,
        acquired_at: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
        fencing_token: i64,
    ) -> Self {
        Self {
            lock_key,
            holder_id,
            acquired_at,
            lease_expiry,
            fencing_token,
        }
    }

    /// Returns the protected resource key.
    #[must_use]
    pub fn lock_key(&self) -> &LockKey {
        &self.lock_key
    }

    /// Returns the replica recorded as holder.
    #[must_use]
    pub fn holder_id(&self) -> &ReplicaId {
        &self.holder_id
    }

    /// Returns the instant the current holder took the lease.
    ///
    /// Renewals keep this value; takeovers and fresh inserts reset it.
    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Returns the instant the lease lapses.
    #[must_use]
    pub fn lease_expiry(&self) -> DateTime<Utc> {
        self.lease_expiry
    }

    /// Returns the fencing token of the current grant.
    #[must_use]
    pub fn fencing_token(&self) -> i64 {
        self.fencing_token
    }

    /// Returns true while the lease still confers exclusivity.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_expiry > now
    }

    /// Returns true when `holder` owns a still-valid lease.
    #[must_use]
    pub fn is_held_by(&self, holder: &ReplicaId, now: DateTime<Utc>) -> bool {
        &self.holder_id == holder && self.is_valid_at(now)
    }

    /// Returns true when the current holder took the lease at `now` rather
    /// than renewing an earlier grant.
    #[must_use]
    pub fn is_new_grant_at(&self, now: DateTime<Utc>) -> bool {
        self.acquired_at == now
    }

    /// Returns true when `candidate` may overwrite this record.
    ///
    /// Expired leases may be taken over by anyone; valid leases only renewed
    /// by their holder.
    #[must_use]
    pub fn admits(&self, candidate: &ReplicaId, now: DateTime<Utc>) -> bool {
        !self.is_valid_at(now) || &self.holder_id == candidate
    }
}
