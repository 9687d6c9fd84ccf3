//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod job;
mod lock;

pub use job::ScheduledJobKind;
pub use lock::{
    LEASE_DURATION_MAX_MS, LOCK_IDENTIFIER_MAX_LENGTH, LeaseDuration, LockKey, LockRecord,
    ReplicaId,
};
