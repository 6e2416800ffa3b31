//! Queue change notifications.
//!
//! Every store publishes these on mutation. The event-driven worker
//! subscribes to `Added` and `Finished` to drain the queue without polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Status, Work, WorkId};

/// A change to one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkEvent {
    pub kind: WorkEventKind,
    pub work_id: WorkId,
    pub work_type: String,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkEventKind {
    /// Inserted: new work, a rerun, or a recurring placeholder.
    Added,
    Allocated,
    /// An attempt ended (success, failure, requeue, or orphan recovery).
    Finished,
    Deleted,
}

impl WorkEvent {
    pub fn new(kind: WorkEventKind, work: &Work) -> Self {
        Self {
            kind,
            work_id: work.id,
            work_type: work.work_type.clone(),
            status: work.status,
            timestamp: Utc::now(),
        }
    }

    /// Events that may have made new work claimable.
    pub fn wakes_workers(&self) -> bool {
        matches!(self.kind, WorkEventKind::Added | WorkEventKind::Finished)
    }
}

/// Capacity of per-store broadcast channels. Slow subscribers observe
/// `Lagged` and should treat it as "something changed".
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
