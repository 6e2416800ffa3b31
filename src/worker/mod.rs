//! Worker loops.
//!
//! [`BaseWorker`] is the execution cycle every worker shares: recover
//! orphans once at startup, reconcile recurring schedules, then drain
//! eligible work up to a batch limit. The concrete workers only decide
//! *when* a cycle runs: on a fixed interval, or in reaction to queue events.

pub mod event_listener;
pub mod interval;

pub use event_listener::{EventListenerOptions, EventListenerWorker};
pub use interval::{IntervalWorker, IntervalWorkerOptions};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::director::WorkerDirector;
use crate::error::Result;
use crate::model::{MarkOldWork, Status, Work};
use crate::queue::WorkQueue;
use crate::telemetry::metrics;

/// A worker that can be started and stopped.
#[async_trait]
pub trait Worker: Send + Sync {
    fn worker_id(&self) -> &str;

    /// Recover orphans and begin triggering cycles.
    async fn start(&self) -> Result<()>;

    /// Stop triggering cycles and claiming work. Safe to call at any time,
    /// more than once. An adapter execution already in flight finishes and
    /// is recorded; nothing further is claimed.
    async fn stop(&self);
}

/// Bounds of one drain cycle.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOptions {
    /// Stop after this many claims. `None` drains until nothing is eligible.
    pub max_work_item_count: Option<usize>,
    /// Instant schedule reconciliation computes next occurrences from.
    pub reference_date: DateTime<Utc>,
}

impl ProcessOptions {
    pub fn now(max_work_item_count: Option<usize>) -> Self {
        Self {
            max_work_item_count,
            reference_date: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    /// Pending recurring items ensured by reconciliation.
    pub scheduled: usize,
    pub processed: usize,
    pub succeeded: usize,
    /// Failed attempts, requeued or terminal.
    pub failed: usize,
}

/// The shared execution cycle, bound to one worker id.
#[derive(Clone)]
pub struct BaseWorker {
    worker_id: String,
    director: Arc<WorkerDirector>,
    queue: Arc<dyn WorkQueue>,
}

impl BaseWorker {
    pub fn new(
        worker_id: impl Into<String>,
        director: Arc<WorkerDirector>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            director,
            queue,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn director(&self) -> &Arc<WorkerDirector> {
        &self.director
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    /// Orphan recovery: fail work this worker left allocated before
    /// `reference_date` (a previous run crashed mid-execution). External
    /// types are exempt; their real state is unknown to this process.
    pub async fn reset(&self, reference_date: DateTime<Utc>) -> Result<Vec<Work>> {
        let types = self.director.active_plugin_types(Some(false));
        if types.is_empty() {
            return Ok(Vec::new());
        }

        let recovered = self
            .queue
            .mark_old_work_as_failed(&MarkOldWork {
                types,
                worker: Some(self.worker_id.clone()),
                reference_date,
            })
            .await?;

        for work in &recovered {
            warn!(
                work_id = %work.id,
                work_type = %work.work_type,
                worker = %self.worker_id,
                "orphaned work marked as failed"
            );
            metrics::work_recovered()
                .add(1, &[KeyValue::new("work_type", work.work_type.clone())]);
        }
        Ok(recovered)
    }

    /// Ensure exactly one pending item per declared schedule, and none for
    /// retired or skipped ones. Idempotent.
    pub async fn autoreschedule_types(&self, reference_date: DateTime<Utc>) -> Result<Vec<Work>> {
        let mut ensured = Vec::new();

        for schedule in self.director.auto_schedules() {
            match schedule.next_work(reference_date) {
                Some(new) => {
                    let work = self.queue.ensure_one_work(new).await?;
                    debug!(
                        work_id = %work.id,
                        schedule_id = %schedule.schedule_id,
                        scheduled = %work.scheduled,
                        "recurring work ensured"
                    );
                    ensured.push(work);
                }
                None => {
                    let removed = self
                        .queue
                        .ensure_no_work(&schedule.work_type, &schedule.schedule_id)
                        .await?;
                    if removed > 0 {
                        debug!(schedule_id = %schedule.schedule_id, removed, "occurrence skipped");
                    }
                }
            }
        }

        for (schedule_id, work_type) in self.director.retired_schedules() {
            let removed = self.queue.ensure_no_work(work_type, schedule_id).await?;
            if removed > 0 {
                info!(schedule_id, removed, "placeholder of removed schedule deleted");
            }
        }

        Ok(ensured)
    }

    /// One cycle: reconcile schedules, then claim and run work until nothing
    /// is eligible or the batch limit is reached.
    pub async fn process(&self, options: ProcessOptions) -> Result<ProcessSummary> {
        self.process_until(options, || false).await
    }

    /// [`process`](Self::process), checking `stopped` before every claim.
    /// Once it returns true no further item is claimed; the item already
    /// running is finished and recorded first.
    pub async fn process_until<F>(
        &self,
        options: ProcessOptions,
        stopped: F,
    ) -> Result<ProcessSummary>
    where
        F: Fn() -> bool,
    {
        if stopped() {
            return Ok(ProcessSummary::default());
        }

        let mut summary = ProcessSummary {
            scheduled: self.autoreschedule_types(options.reference_date).await?.len(),
            ..ProcessSummary::default()
        };

        loop {
            if stopped() {
                debug!(worker = %self.worker_id, "stop requested, ending cycle");
                break;
            }
            if options
                .max_work_item_count
                .is_some_and(|max| summary.processed >= max)
            {
                debug!(worker = %self.worker_id, "batch limit reached");
                break;
            }

            let Some(work) = self
                .director
                .process_next_work(self.queue.as_ref(), &self.worker_id)
                .await?
            else {
                break;
            };

            summary.processed += 1;
            match work.status {
                Status::Success => summary.succeeded += 1,
                _ => summary.failed += 1,
            }
        }

        metrics::worker_cycles().add(1, &[KeyValue::new("worker", self.worker_id.clone())]);
        Ok(summary)
    }
}

/// `HOSTNAME` when set, else a random id.
pub fn default_worker_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("worker-{}", crate::model::WorkId::new().short()))
}
