//! Application services and ports.

#![forbid(unsafe_code)]

mod job_ports;
mod job_runner;
mod lock_coordinator;
mod lock_ports;

pub use job_ports::{JobSchedule, ReleasePolicy, ScheduledJob};
pub use job_runner::{JobContext, JobRunner, TickOutcome};
pub use lock_coordinator::{AcquireOutcome, LeaseGrant, LockCoordinator, ReleaseOutcome};
pub use lock_ports::{LeaseClock, LeaseObservation, LockStore, SystemLeaseClock};
