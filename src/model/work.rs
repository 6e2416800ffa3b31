//! Work items and their lifecycle.
//!
//! A work item is one unit of background execution. Its `work_type` selects
//! the adapter that runs it; everything else is scheduling metadata the queue
//! uses to decide who runs it, when, and how often it may be retried.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Retry budget given to work that does not ask for one.
pub const DEFAULT_RETRIES: u32 = 20;

/// Longest accepted execution timeout (30 days).
pub const MAX_TIMEOUT_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Timeouts are whole milliseconds in `1..=MAX_TIMEOUT_MS`.
pub fn check_timeout_ms(ms: u64) -> Result<()> {
    if ms == 0 || ms > MAX_TIMEOUT_MS {
        return Err(Error::InvalidWork(format!(
            "timeout must be between 1ms and {MAX_TIMEOUT_MS}ms, got {ms}ms"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Work
// ---------------------------------------------------------------------------

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub id: WorkId,

    /// Registry key; selects the adapter that executes this item.
    #[serde(rename = "type")]
    pub work_type: String,

    /// Payload handed verbatim to the adapter. The queue never interprets it.
    pub input: serde_json::Value,

    /// Higher claims first.
    pub priority: i32,

    /// Not eligible for claiming before this instant.
    pub scheduled: DateTime<Utc>,

    /// Remaining retry budget. A failure at zero is terminal.
    pub retries: u32,

    /// Executions started so far.
    pub attempts: u32,

    pub status: Status,

    /// Worker holding (or last holding) the claim.
    pub worker: Option<String>,

    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,

    /// Source item when this one is a re-run.
    pub original_work_id: Option<WorkId>,

    /// Set on recurring work; at most one pending item exists per value.
    pub schedule_id: Option<String>,

    /// Maximum execution time. Also bounds the claim lease.
    pub timeout_ms: Option<u64>,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl Work {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Whether an allocation made at `started` has outlived its timeout.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.started, self.timeout_ms) {
            // A lease too long to represent never expires.
            (Status::Allocated, Some(started), Some(ms)) => i64::try_from(ms)
                .ok()
                .and_then(chrono::Duration::try_milliseconds)
                .and_then(|lease| started.checked_add_signed(lease))
                .is_some_and(|expires| expires < now),
            _ => false,
        }
    }

    /// Can a worker claim this item at `now`?
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            Status::New => self.scheduled <= now,
            Status::Allocated => self.lease_expired(now),
            _ => false,
        }
    }

    /// Pending: created, not yet claimed.
    pub fn is_pending(&self) -> bool {
        self.status == Status::New
    }

    pub fn succeeded(&self) -> bool {
        self.status == Status::Success
    }

    /// Wall time of the most recent attempt, if it finished.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started, self.finished) {
            (Some(s), Some(f)) => Some((f - s).num_milliseconds()),
            _ => None,
        }
    }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters, for listings.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(WorkId)
            .map_err(|e| Error::Other(format!("invalid work id '{s}': {e}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Waiting for its scheduled instant and a worker.
    New,
    /// Claimed by a worker, executing.
    Allocated,
    Success,
    /// Failed with no retries left, or recovered as an orphan.
    Failed,
    /// Administratively removed. Terminal.
    Deleted,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::New,
        Status::Allocated,
        Status::Success,
        Status::Failed,
        Status::Deleted,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (New, Allocated)
                | (Allocated, Allocated) // lease expired, re-claimed
                | (Allocated, Success)
                | (Allocated, Failed)
                | (Allocated, New) // retry or requeue
                | (New | Allocated | Success | Failed, Deleted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Success | Status::Failed | Status::Deleted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::New => "NEW",
            Status::Allocated => "ALLOCATED",
            Status::Success => "SUCCESS",
            Status::Failed => "FAILED",
            Status::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Other(format!("unknown status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new work items. The public API for enqueueing work.
#[derive(Debug, Clone)]
pub struct NewWork {
    pub(crate) work_type: String,
    pub(crate) input: serde_json::Value,
    pub(crate) priority: i32,
    pub(crate) scheduled: Option<DateTime<Utc>>,
    pub(crate) retries: u32,
    pub(crate) timeout_ms: Option<u64>,
    pub(crate) schedule_id: Option<String>,
    pub(crate) original_work_id: Option<WorkId>,
}

impl NewWork {
    pub fn new(work_type: impl Into<String>) -> Self {
        Self {
            work_type: work_type.into(),
            input: serde_json::Value::Null,
            priority: 0,
            scheduled: None,
            retries: DEFAULT_RETRIES,
            timeout_ms: None,
            schedule_id: None,
            original_work_id: None,
        }
    }

    pub fn input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled = Some(at);
        self
    }

    pub fn retries(mut self, n: u32) -> Self {
        self.retries = n;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn schedule_id(mut self, id: impl Into<String>) -> Self {
        self.schedule_id = Some(id.into());
        self
    }

    pub fn original_work(mut self, id: WorkId) -> Self {
        self.original_work_id = Some(id);
        self
    }

    pub fn work_type(&self) -> &str {
        &self.work_type
    }

    pub fn get_schedule_id(&self) -> Option<&str> {
        self.schedule_id.as_deref()
    }

    /// Materialize as a `NEW` item created at `now`.
    /// Rejected before insertion by every store.
    pub fn validate(&self) -> Result<()> {
        if self.work_type.trim().is_empty() {
            return Err(Error::InvalidWork("work type is empty".to_string()));
        }
        if i32::try_from(self.retries).is_err() {
            return Err(Error::InvalidWork(format!(
                "retries must be at most {}, got {}",
                i32::MAX,
                self.retries
            )));
        }
        match self.timeout_ms {
            Some(ms) => check_timeout_ms(ms),
            None => Ok(()),
        }
    }

    pub fn into_work(self, now: DateTime<Utc>) -> Work {
        Work {
            id: WorkId::new(),
            work_type: self.work_type,
            input: self.input,
            priority: self.priority,
            scheduled: self.scheduled.unwrap_or(now),
            retries: self.retries,
            attempts: 0,
            status: Status::New,
            worker: None,
            started: None,
            finished: None,
            result: None,
            error: None,
            original_work_id: self.original_work_id,
            schedule_id: self.schedule_id,
            timeout_ms: self.timeout_ms,
            created: now,
            updated: now,
            deleted: None,
        }
    }

    /// A fresh copy of `source`, linked back to it.
    pub fn rerun_of(source: &Work) -> Self {
        Self {
            work_type: source.work_type.clone(),
            input: source.input.clone(),
            priority: source.priority,
            scheduled: None,
            retries: source.retries,
            timeout_ms: source.timeout_ms,
            schedule_id: None,
            original_work_id: Some(source.id),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue operation arguments
// ---------------------------------------------------------------------------

/// Atomic claim request.
#[derive(Debug, Clone)]
pub struct AllocateWork {
    /// Only items of these types are eligible.
    pub types: Vec<String>,
    pub worker: String,
}

/// Outcome of one execution attempt, written back by the claiming worker.
#[derive(Debug, Clone)]
pub struct FinishWork {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub worker: String,
    /// On failure with retries left: requeue as `NEW` at this instant.
    /// `None` makes the failure terminal.
    pub retry_at: Option<DateTime<Utc>>,
}

impl FinishWork {
    pub fn duration_ms(&self) -> i64 {
        (self.finished - self.started).num_milliseconds()
    }
}

/// Orphan recovery request.
#[derive(Debug, Clone)]
pub struct MarkOldWork {
    pub types: Vec<String>,
    /// Restrict to items held by this worker. `None` covers every holder.
    pub worker: Option<String>,
    /// Only allocations started before this instant are recovered.
    pub reference_date: DateTime<Utc>,
}

/// Error payload recorded when recovery fails an orphaned item.
pub fn orphan_error(worker: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "name": "ORPHANED",
        "message": match worker {
            Some(w) => format!("worker {w} restarted while the work was allocated"),
            None => "worker restarted while the work was allocated".to_string(),
        },
    })
}
