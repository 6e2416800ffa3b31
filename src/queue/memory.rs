//! In-process work queue.
//!
//! Holds every item in insertion order behind one async mutex, so each
//! operation is a single critical section: the claim step cannot interleave
//! with another claim, which gives the same exclusivity the Postgres store
//! gets from `FOR UPDATE SKIP LOCKED`.

use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Reverse;
use tokio::sync::{Mutex, broadcast};

use super::{WorkQueue, require_schedule_id};
use crate::error::{Error, Result};
use crate::event::{EVENT_CHANNEL_CAPACITY, WorkEvent, WorkEventKind};
use crate::model::*;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

pub struct MemoryQueue {
    /// Insertion order doubles as creation order for claim tie-breaks.
    items: Mutex<Vec<Work>>,
    events: broadcast::Sender<WorkEvent>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            items: Mutex::new(Vec::new()),
            events,
        }
    }

    fn publish(&self, kind: WorkEventKind, work: &Work) {
        // No subscribers is fine.
        let _ = self.events.send(WorkEvent::new(kind, work));
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn find_mut(items: &mut [Work], id: WorkId) -> Result<&mut Work> {
    items
        .iter_mut()
        .find(|w| w.id == id)
        .ok_or_else(|| Error::NotFound(format!("work item {id}")))
}

fn record_added(work: &Work) {
    metrics::work_added().add(1, &[KeyValue::new("work_type", work.work_type.clone())]);
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn add_work(&self, new: NewWork) -> Result<Work> {
        new.validate()?;
        let work = new.into_work(Utc::now());
        self.items.lock().await.push(work.clone());
        record_added(&work);
        self.publish(WorkEventKind::Added, &work);
        Ok(work)
    }

    async fn ensure_one_work(&self, new: NewWork) -> Result<Work> {
        new.validate()?;
        let schedule_id = require_schedule_id(&new)?.to_string();
        let now = Utc::now();
        let mut items = self.items.lock().await;

        if let Some(existing) = items
            .iter_mut()
            .find(|w| w.is_pending() && w.schedule_id.as_deref() == Some(schedule_id.as_str()))
        {
            let due = new.scheduled.unwrap_or(now);
            if due < existing.scheduled {
                existing.scheduled = due;
                existing.updated = now;
            }
            return Ok(existing.clone());
        }

        let work = new.into_work(now);
        items.push(work.clone());
        drop(items);

        record_added(&work);
        self.publish(WorkEventKind::Added, &work);
        Ok(work)
    }

    async fn ensure_no_work(&self, work_type: &str, schedule_id: &str) -> Result<u64> {
        let now = Utc::now();
        let mut removed = Vec::new();
        {
            let mut items = self.items.lock().await;
            for work in items.iter_mut().filter(|w| {
                w.is_pending()
                    && w.work_type == work_type
                    && w.schedule_id.as_deref() == Some(schedule_id)
            }) {
                work.status = Status::Deleted;
                work.deleted = Some(now);
                work.updated = now;
                removed.push(work.clone());
            }
        }
        for work in &removed {
            self.publish(WorkEventKind::Deleted, work);
        }
        Ok(removed.len() as u64)
    }

    async fn allocate_work(&self, request: &AllocateWork) -> Result<Option<Work>> {
        let now = Utc::now();
        let mut items = self.items.lock().await;

        let best = items
            .iter()
            .enumerate()
            .filter(|(_, w)| request.types.contains(&w.work_type) && w.is_claimable(now))
            .min_by_key(|(seq, w)| (Reverse(w.priority), w.scheduled, w.created, *seq))
            .map(|(idx, _)| idx);

        let Some(idx) = best else {
            return Ok(None);
        };

        let work = &mut items[idx];
        work.status = Status::Allocated;
        work.worker = Some(request.worker.clone());
        work.started = Some(now);
        work.finished = None;
        work.attempts += 1;
        work.updated = now;
        let work = work.clone();
        drop(items);

        metrics::work_allocated().add(1, &[KeyValue::new("work_type", work.work_type.clone())]);
        self.publish(WorkEventKind::Allocated, &work);
        Ok(Some(work))
    }

    async fn find_work(&self, id: WorkId) -> Result<Option<Work>> {
        Ok(self.items.lock().await.iter().find(|w| w.id == id).cloned())
    }

    async fn find_work_queue(&self, filter: &WorkFilter) -> Result<Vec<Work>> {
        let items = self.items.lock().await;
        let mut matching: Vec<Work> = items
            .iter()
            .rev()
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();
        // Stable sort keeps reverse insertion order for equal timestamps.
        matching.sort_by_key(|w| Reverse(w.created));
        Ok(matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn count(&self, filter: &WorkFilter) -> Result<u64> {
        let items = self.items.lock().await;
        Ok(items.iter().filter(|w| filter.matches(w)).count() as u64)
    }

    async fn finish_work(&self, id: WorkId, finish: FinishWork) -> Result<Work> {
        let now = Utc::now();
        let mut deleted = Vec::new();
        let mut items = self.items.lock().await;

        let work = find_mut(&mut items, id)?;
        if work.status != Status::Allocated || work.worker.as_deref() != Some(&finish.worker) {
            return Err(Error::LeaseLost {
                id: id.to_string(),
                worker: finish.worker,
            });
        }

        work.result = finish.result;
        work.error = finish.error;
        work.started = Some(finish.started);
        work.finished = Some(finish.finished);
        work.updated = now;
        work.status = match finish.retry_at {
            _ if finish.success => Status::Success,
            Some(at) if work.retries > 0 => {
                work.retries -= 1;
                work.scheduled = at;
                Status::New
            }
            _ => Status::Failed,
        };
        let work = work.clone();

        // A requeued recurring item takes over its schedule's pending slot.
        if work.status == Status::New
            && let Some(ref schedule_id) = work.schedule_id
        {
            for other in items.iter_mut().filter(|w| {
                w.id != id && w.is_pending() && w.schedule_id.as_ref() == Some(schedule_id)
            }) {
                other.status = Status::Deleted;
                other.deleted = Some(now);
                other.updated = now;
                deleted.push(other.clone());
            }
        }
        drop(items);

        metrics::work_finished().add(
            1,
            &[
                KeyValue::new("work_type", work.work_type.clone()),
                KeyValue::new("status", work.status.to_string()),
            ],
        );
        for other in &deleted {
            self.publish(WorkEventKind::Deleted, other);
        }
        self.publish(WorkEventKind::Finished, &work);
        Ok(work)
    }

    async fn delete_work(&self, id: WorkId) -> Result<Work> {
        let now = Utc::now();
        let mut items = self.items.lock().await;
        let work = find_mut(&mut items, id)?;
        if !work.status.can_transition_to(Status::Deleted) {
            return Err(Error::InvalidTransition {
                from: work.status.to_string(),
                to: Status::Deleted.to_string(),
            });
        }
        work.status = Status::Deleted;
        work.deleted = Some(now);
        work.updated = now;
        let work = work.clone();
        drop(items);

        self.publish(WorkEventKind::Deleted, &work);
        Ok(work)
    }

    async fn mark_old_work_as_failed(&self, request: &MarkOldWork) -> Result<Vec<Work>> {
        let now = Utc::now();
        let mut recovered = Vec::new();
        {
            let mut items = self.items.lock().await;
            for work in items.iter_mut().filter(|w| {
                w.status == Status::Allocated
                    && request.types.contains(&w.work_type)
                    && request
                        .worker
                        .as_ref()
                        .is_none_or(|worker| w.worker.as_ref() == Some(worker))
                    && w.started.is_some_and(|s| s < request.reference_date)
            }) {
                work.status = Status::Failed;
                work.finished = Some(now);
                work.error = Some(orphan_error(work.worker.as_deref()));
                work.updated = now;
                recovered.push(work.clone());
            }
        }
        for work in &recovered {
            self.publish(WorkEventKind::Finished, work);
        }
        Ok(recovered)
    }

    async fn get_report(&self, filter: &ReportFilter) -> Result<Vec<WorkReport>> {
        let items = self.items.lock().await;
        Ok(WorkReport::aggregate(items.iter().filter(|w| filter.matches(w))))
    }

    fn subscribe(&self) -> broadcast::Receiver<WorkEvent> {
        self.events.subscribe()
    }
}
