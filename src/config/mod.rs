//! Typed configuration from environment variables.
//!
//! Loaded once at startup; any invalid value fails fast. The database URL
//! is wrapped in `secrecy::SecretString` so it never reaches the logs.

pub mod schedules;

use secrecy::SecretString;
use std::str::FromStr;

use crate::director::RetryPolicy;
use crate::error::{Error, Result};
use crate::schedule::Schedule;
use crate::worker::default_worker_id;
use crate::worker::interval::DEFAULT_SCHEDULE;

/// Which worker `serve` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerKind {
    #[default]
    Interval,
    Event,
}

impl FromStr for WorkerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interval" => Ok(WorkerKind::Interval),
            "event" | "event_listener" => Ok(WorkerKind::Event),
            other => Err(Error::Config(format!("unknown worker kind '{other}'"))),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    /// `None` runs against an in-memory queue.
    pub database_url: Option<SecretString>,
    pub worker_id: String,
    pub worker_kind: WorkerKind,
    pub worker_schedule: Schedule,
    pub batch_count: Option<usize>,
    pub retry_policy: RetryPolicy,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// In local dev, call `dotenvy::dotenv().ok()` first.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let worker_schedule = var("WORKER_SCHEDULE").unwrap_or_else(|| DEFAULT_SCHEDULE.to_string());
        let worker_schedule = Schedule::parse(&worker_schedule)
            .map_err(|e| Error::Config(format!("WORKER_SCHEDULE: {e}")))?;

        let batch_count = var("WORKER_BATCH_COUNT")
            .map(|v| {
                v.parse::<usize>()
                    .map_err(|_| Error::Config(format!("WORKER_BATCH_COUNT must be a number, got '{v}'")))
            })
            .transpose()?;

        Ok(Self {
            database_url: var("DATABASE_URL").map(SecretString::from),
            worker_id: var("WORKER_ID").unwrap_or_else(default_worker_id),
            worker_kind: var("WORKER_KIND")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or_default(),
            worker_schedule,
            batch_count,
            retry_policy: var("RETRY_BACKOFF")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or_default(),
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}
