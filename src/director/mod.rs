//! Plugin registry and the claim-and-execute primitive.
//!
//! The director maps each work type to the adapter that executes it and
//! holds the recurring schedule declarations. It is populated once at
//! startup, then shared read-only (behind an `Arc`) with every worker.

pub mod adapter;
pub mod retry;

pub use adapter::{FnAdapter, WorkAdapter, WorkContext};
pub use retry::RetryPolicy;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{AllocateWork, FinishWork, NewWork, Work, check_timeout_ms};
use crate::queue::WorkQueue;
use crate::schedule::Schedule;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_work_span};

// ---------------------------------------------------------------------------
// Schedule declarations
// ---------------------------------------------------------------------------

/// What an input generator sees about the occurrence being seeded.
#[derive(Debug, Clone)]
pub struct WorkDraft {
    pub work_type: String,
    pub schedule_id: String,
    pub scheduled: DateTime<Utc>,
    pub priority: i32,
}

/// Builds the payload for a scheduled occurrence. `None` skips the
/// occurrence and removes any pending placeholder.
pub type InputFn = Arc<dyn Fn(&WorkDraft) -> Option<serde_json::Value> + Send + Sync>;

/// A recurring job declaration.
#[derive(Clone)]
pub struct AutoSchedule {
    pub work_type: String,
    pub schedule_id: String,
    pub schedule: Schedule,
    pub priority: i32,
    pub retries: u32,
    pub timeout: Option<Duration>,
    pub input: Option<InputFn>,
}

impl AutoSchedule {
    /// The schedule id defaults to the work type.
    pub fn new(work_type: impl Into<String>, schedule: Schedule) -> Self {
        let work_type = work_type.into();
        Self {
            schedule_id: work_type.clone(),
            work_type,
            schedule,
            priority: 0,
            retries: 0,
            timeout: None,
            input: None,
        }
    }

    pub fn schedule_id(mut self, id: impl Into<String>) -> Self {
        self.schedule_id = id.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn input<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkDraft) -> Option<serde_json::Value> + Send + Sync + 'static,
    {
        self.input = Some(Arc::new(f));
        self
    }

    /// Same payload for every occurrence.
    pub fn static_input(self, value: serde_json::Value) -> Self {
        self.input(move |_| Some(value.clone()))
    }

    /// The work to ensure for the first occurrence after `reference_date`,
    /// or `None` when the schedule is exhausted or the generator skips it.
    pub fn next_work(&self, reference_date: DateTime<Utc>) -> Option<NewWork> {
        let scheduled = self.schedule.next_after(reference_date)?;
        let draft = WorkDraft {
            work_type: self.work_type.clone(),
            schedule_id: self.schedule_id.clone(),
            scheduled,
            priority: self.priority,
        };
        let input = match self.input {
            Some(ref f) => f(&draft)?,
            None => serde_json::Value::Null,
        };

        let mut new = NewWork::new(&self.work_type)
            .schedule_id(&self.schedule_id)
            .scheduled(scheduled)
            .priority(self.priority)
            .retries(self.retries)
            .input(input);
        if let Some(timeout) = self.timeout {
            new = new.timeout(timeout);
        }
        Some(new)
    }
}

impl std::fmt::Debug for AutoSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoSchedule")
            .field("work_type", &self.work_type)
            .field("schedule_id", &self.schedule_id)
            .field("schedule", &self.schedule.as_str())
            .field("priority", &self.priority)
            .field("retries", &self.retries)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Director
// ---------------------------------------------------------------------------

pub struct WorkerDirector {
    adapters: HashMap<String, Arc<dyn WorkAdapter>>,
    /// Keyed by schedule id.
    auto_schedules: BTreeMap<String, AutoSchedule>,
    /// Removed declarations (schedule id → work type) whose pending
    /// placeholders reconciliation still has to clear.
    retired_schedules: BTreeMap<String, String>,
    retry_policy: RetryPolicy,
}

impl Default for WorkerDirector {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerDirector {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            auto_schedules: BTreeMap::new(),
            retired_schedules: BTreeMap::new(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Register an adapter for its work type. The last registration wins.
    pub fn register_adapter(&mut self, adapter: impl WorkAdapter) {
        self.register_shared(Arc::new(adapter));
    }

    pub fn register_shared(&mut self, adapter: Arc<dyn WorkAdapter>) {
        let key = adapter.key().to_string();
        if let Some(previous) = self.adapters.insert(key.clone(), adapter) {
            warn!(
                work_type = %key,
                previous = previous.label(),
                "adapter registration overrides an existing one"
            );
        } else {
            debug!(work_type = %key, "adapter registered");
        }
    }

    pub fn adapter(&self, work_type: &str) -> Option<&Arc<dyn WorkAdapter>> {
        self.adapters.get(work_type)
    }

    /// Registered work types, sorted. `Some(false)` keeps only types this
    /// process executes itself; `Some(true)` only external ones.
    pub fn active_plugin_types(&self, external: Option<bool>) -> Vec<String> {
        let mut types: Vec<String> = self
            .adapters
            .iter()
            .filter(|(_, a)| external.is_none_or(|ext| a.external() == ext))
            .map(|(key, _)| key.clone())
            .collect();
        types.sort();
        types
    }

    /// Declare a recurring job. Its work type must already be registered.
    pub fn configure_auto_schedule(&mut self, schedule: AutoSchedule) -> Result<()> {
        if !self.adapters.contains_key(&schedule.work_type) {
            return Err(Error::UnknownType(schedule.work_type.clone()));
        }
        // Same checks the store applies to each occurrence, surfaced at startup.
        NewWork::new(&schedule.work_type)
            .retries(schedule.retries)
            .validate()?;
        if let Some(timeout) = schedule.timeout {
            check_timeout_ms(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX))?;
        }
        info!(
            work_type = %schedule.work_type,
            schedule_id = %schedule.schedule_id,
            schedule = %schedule.schedule,
            "auto schedule configured"
        );
        self.retired_schedules.remove(&schedule.schedule_id);
        self.auto_schedules
            .insert(schedule.schedule_id.clone(), schedule);
        Ok(())
    }

    /// Drop a declaration; the next reconciliation deletes its placeholder.
    pub fn remove_auto_schedule(&mut self, schedule_id: &str) -> Option<AutoSchedule> {
        let removed = self.auto_schedules.remove(schedule_id)?;
        self.retired_schedules
            .insert(removed.schedule_id.clone(), removed.work_type.clone());
        Some(removed)
    }

    pub fn auto_schedules(&self) -> impl Iterator<Item = &AutoSchedule> {
        self.auto_schedules.values()
    }

    /// `(schedule_id, work_type)` of removed declarations.
    pub fn retired_schedules(&self) -> impl Iterator<Item = (&str, &str)> {
        self.retired_schedules
            .iter()
            .map(|(id, ty)| (id.as_str(), ty.as_str()))
    }

    /// Claim the best eligible item, run it, record the outcome.
    ///
    /// Returns the item as written back, or `None` when nothing was
    /// eligible. Adapter failures (errors, panics, timeouts) are recorded
    /// on the item and never surface here; only store errors do.
    pub async fn process_next_work(
        &self,
        queue: &dyn WorkQueue,
        worker_id: &str,
    ) -> Result<Option<Work>> {
        let types = self.active_plugin_types(Some(false));
        if types.is_empty() {
            return Ok(None);
        }

        let request = AllocateWork {
            types,
            worker: worker_id.to_string(),
        };
        let Some(work) = queue.allocate_work(&request).await? else {
            return Ok(None);
        };

        let span = start_work_span(&work.work_type, &work.id, worker_id);
        async {
            record_state_transition(&span, "NEW", "ALLOCATED");
            let started = work.started.unwrap_or_else(Utc::now);
            let outcome = self.execute(&work, worker_id).await;
            let finished = Utc::now();

            let (success, result, error) = match outcome {
                Ok(value) => (true, Some(value), None),
                Err(error) => (false, None, Some(error)),
            };
            let retry_at = (!success && work.retries > 0)
                .then(|| self.retry_policy.retry_at(finished, work.attempts));

            let finish = FinishWork {
                success,
                result,
                error,
                started,
                finished,
                worker: worker_id.to_string(),
                retry_at,
            };
            metrics::work_duration_ms().record(
                finish.duration_ms() as f64,
                &[KeyValue::new("work_type", work.work_type.clone())],
            );

            match queue.finish_work(work.id, finish).await {
                Ok(done) => {
                    record_state_transition(&span, "ALLOCATED", done.status.as_str());
                    if done.succeeded() {
                        info!(work_id = %done.id, work_type = %done.work_type, "work succeeded");
                    } else {
                        warn!(
                            work_id = %done.id,
                            work_type = %done.work_type,
                            status = %done.status,
                            retries_left = done.retries,
                            error = ?done.error,
                            "work failed"
                        );
                    }
                    Ok(Some(done))
                }
                Err(Error::LeaseLost { id, worker }) => {
                    warn!(work_id = %id, worker = %worker, "result discarded: claim was lost");
                    Ok(Some(work.clone()))
                }
                Err(e) => Err(e),
            }
        }
        .instrument(span.clone())
        .await
    }

    /// Run the adapter on its own task so panics and timeouts are contained.
    async fn execute(
        &self,
        work: &Work,
        worker_id: &str,
    ) -> std::result::Result<serde_json::Value, serde_json::Value> {
        let Some(adapter) = self.adapters.get(&work.work_type).cloned() else {
            return Err(error_value(
                "NO_ADAPTER",
                format!("no adapter registered for {}", work.work_type),
            ));
        };

        let ctx = WorkContext {
            work_id: work.id,
            worker: worker_id.to_string(),
            attempt: work.attempts,
        };
        let input = work.input.clone();
        let handle = tokio::spawn(async move { adapter.do_work(input, ctx).await });
        let abort = handle.abort_handle();

        let joined = match work.timeout() {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    abort.abort();
                    return Err(error_value(
                        "TIMEOUT",
                        format!("exceeded timeout of {}ms", limit.as_millis()),
                    ));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(error_value("WORK_FAILED", format!("{e:#}"))),
            Err(e) if e.is_panic() => Err(error_value("PANIC", "adapter panicked".to_string())),
            Err(e) => Err(error_value("CANCELLED", e.to_string())),
        }
    }
}

fn error_value(name: &str, message: String) -> serde_json::Value {
    serde_json::json!({ "name": name, "message": message })
}
