//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod http_scheduled_job;
mod in_memory_lock_store;
mod postgres_lock_store;

pub use http_scheduled_job::HttpScheduledJob;
pub use in_memory_lock_store::InMemoryLockStore;
pub use postgres_lock_store::PostgresLockStore;
