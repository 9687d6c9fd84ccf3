use std::env;

use murmur_application::{JobSchedule, ReleasePolicy};
use murmur_core::{AppError, AppResult};
use murmur_domain::{LeaseDuration, ReplicaId, ScheduledJobKind};

/// Where lease rows live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStoreBackend {
    /// Shared PostgreSQL database; required for multi-replica deployments.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
    /// Process-local map, only coordinates jobs within this replica.
    Memory,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub lock_store: LockStoreBackend,
    pub replica_id: ReplicaId,
    pub api_base_url: String,
    pub worker_shared_secret: String,
    pub max_batches_per_tick: u32,
    pub schedules: Vec<JobSchedule>,
}

impl WorkerConfig {
    pub fn load() -> AppResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let lock_store = match optional_value(&lookup, "LOCK_STORE_BACKEND")
            .unwrap_or_else(|| "postgres".to_owned())
            .to_ascii_lowercase()
            .as_str()
        {
            "postgres" => LockStoreBackend::Postgres {
                database_url: required_value(&lookup, "DATABASE_URL")?,
                max_connections: parse_value(&lookup, "DATABASE_MAX_CONNECTIONS", 5_u32)?,
            },
            "memory" => LockStoreBackend::Memory,
            other => {
                return Err(AppError::Validation(format!(
                    "invalid LOCK_STORE_BACKEND value '{other}', expected 'postgres' or 'memory'"
                )));
            }
        };

        let replica_id = match lookup("REPLICA_ID") {
            Some(value) => ReplicaId::new(value).map_err(|error| labelled("REPLICA_ID", error))?,
            None => ReplicaId::new(generated_replica_id())?,
        };
        let api_base_url = optional_value(&lookup, "JOB_API_BASE_URL")
            .unwrap_or_else(|| "http://127.0.0.1:3001".to_owned())
            .trim_end_matches('/')
            .to_owned();
        let worker_shared_secret = required_value(&lookup, "WORKER_SHARED_SECRET")?;
        let max_batches_per_tick = parse_value(&lookup, "JOB_MAX_BATCHES_PER_TICK", 10_u32)?;

        if max_batches_per_tick == 0 {
            return Err(AppError::Validation(
                "JOB_MAX_BATCHES_PER_TICK must be greater than zero".to_owned(),
            ));
        }

        if matches!(
            lock_store,
            LockStoreBackend::Postgres {
                max_connections: 0,
                ..
            }
        ) {
            return Err(AppError::Validation(
                "DATABASE_MAX_CONNECTIONS must be greater than zero".to_owned(),
            ));
        }

        let mut schedules = Vec::new();
        for kind in ScheduledJobKind::ALL {
            if let Some(schedule) = load_schedule(&lookup, kind)? {
                schedules.push(schedule);
            }
        }

        Ok(Self {
            lock_store,
            replica_id,
            api_base_url,
            worker_shared_secret,
            max_batches_per_tick,
            schedules,
        })
    }
}

fn load_schedule(
    lookup: &impl Fn(&str) -> Option<String>,
    kind: ScheduledJobKind,
) -> AppResult<Option<JobSchedule>> {
    let prefix = kind.env_prefix();
    let enabled = parse_value(lookup, format!("{prefix}_ENABLED").as_str(), true)?;
    if !enabled {
        return Ok(None);
    }

    let interval_name = format!("{prefix}_INTERVAL_MS");
    let lease_name = format!("{prefix}_LEASE_MS");
    let interval_ms = parse_value(lookup, interval_name.as_str(), kind.default_interval_ms())?;
    let lease_ms = parse_value(lookup, lease_name.as_str(), kind.default_lease_ms())?;
    let lease =
        LeaseDuration::from_millis(lease_ms).map_err(|error| labelled(lease_name.as_str(), error))?;
    let release_policy = match optional_value(lookup, format!("{prefix}_RELEASE").as_str()) {
        Some(value) => ReleasePolicy::parse(value.as_str())?,
        None => ReleasePolicy::ReleaseOnCompletion,
    };

    JobSchedule::new(kind, interval_ms, lease, release_policy).map(Some)
}

fn labelled(name: &str, error: AppError) -> AppError {
    match error {
        AppError::Validation(message) => AppError::Validation(format!("invalid {name}: {message}")),
        other => other,
    }
}

fn generated_replica_id() -> String {
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(8)
        .collect();
    format!("worker-{}-{suffix}", std::process::id())
}

fn optional_value(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required_value(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> AppResult<String> {
    optional_value(lookup, name).ok_or_else(|| AppError::Validation(format!("{name} is required")))
}

fn parse_value<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> AppResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional_value(lookup, name) {
        Some(value) => value.parse::<T>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        None => Ok(default),
    }
}
