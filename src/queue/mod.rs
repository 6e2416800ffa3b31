//! The work queue store contract.
//!
//! A `WorkQueue` is the single shared mutable resource of the system and the
//! only place mutual exclusion between worker processes is enforced: every
//! operation here must be atomic with respect to concurrent callers, in this
//! process and in others sharing the same backing store.
//!
//! Two implementations ship with the crate: [`MemoryQueue`] for a single
//! process (and tests), and [`crate::db::Db`] on Postgres.

pub mod memory;

pub use memory::MemoryQueue;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::event::WorkEvent;
use crate::model::*;

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Insert a new `NEW` item.
    async fn add_work(&self, new: NewWork) -> Result<Work>;

    /// Idempotent upsert keyed by `schedule_id`: returns the pending item for
    /// that schedule if one exists (moved earlier if `new` is due sooner),
    /// otherwise inserts `new`.
    async fn ensure_one_work(&self, new: NewWork) -> Result<Work>;

    /// Delete any pending placeholder for a schedule. Returns how many.
    async fn ensure_no_work(&self, work_type: &str, schedule_id: &str) -> Result<u64>;

    /// Atomically claim the best eligible item: highest priority, then
    /// earliest `scheduled`, then oldest. `None` when nothing is eligible.
    async fn allocate_work(&self, request: &AllocateWork) -> Result<Option<Work>>;

    async fn find_work(&self, id: WorkId) -> Result<Option<Work>>;

    /// Newest first, honouring the filter's limit and offset.
    async fn find_work_queue(&self, filter: &WorkFilter) -> Result<Vec<Work>>;

    async fn count(&self, filter: &WorkFilter) -> Result<u64>;

    /// Record an attempt's outcome. Fails with [`Error::LeaseLost`] when the
    /// item is no longer allocated to `finish.worker`.
    async fn finish_work(&self, id: WorkId, finish: FinishWork) -> Result<Work>;

    /// Soft delete: the item moves to `DELETED` and stays inspectable.
    async fn delete_work(&self, id: WorkId) -> Result<Work>;

    /// Fail allocations started before the reference date. Returns the
    /// recovered items.
    async fn mark_old_work_as_failed(&self, request: &MarkOldWork) -> Result<Vec<Work>>;

    async fn get_report(&self, filter: &ReportFilter) -> Result<Vec<WorkReport>>;

    fn subscribe(&self) -> broadcast::Receiver<WorkEvent>;

    /// Enqueue a fresh copy of a finished item, linked through
    /// `original_work_id`.
    async fn rerun_work(&self, id: WorkId) -> Result<Work> {
        let source = self
            .find_work(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("work item {id}")))?;
        if !source.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: source.status.to_string(),
                to: "rerun".to_string(),
            });
        }
        self.add_work(NewWork::rerun_of(&source)).await
    }
}

pub(crate) fn require_schedule_id(new: &NewWork) -> Result<&str> {
    new.get_schedule_id().ok_or_else(|| {
        Error::Other(format!(
            "ensure_one_work needs a schedule id ({})",
            new.work_type()
        ))
    })
}
