//! Drains the queue in reaction to change events.
//!
//! Bursts of events collapse through a [`Debouncer`] into one drain. A
//! low-frequency fallback cycle covers work that becomes due without any
//! event (a delayed `scheduled`, an expired lease).
//!
//! Run at most one of these per queue: several listeners all reconcile on
//! every event, which is redundant though not incorrect.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::{BaseWorker, ProcessOptions, Worker, default_worker_id};
use crate::debounce::{BoxedFuture, DebouncedFn, Debouncer};
use crate::director::WorkerDirector;
use crate::error::Result;
use crate::queue::WorkQueue;

#[derive(Debug, Clone)]
pub struct EventListenerOptions {
    pub worker_id: String,
    /// Quiet window collapsing event bursts.
    pub debounce: Duration,
    /// Delay before the unconditional reconciliation at start.
    pub settle_delay: Duration,
    /// Period of the safety-net cycle; `None` disables it.
    pub fallback_interval: Option<Duration>,
}

impl Default for EventListenerOptions {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            debounce: Duration::from_millis(300),
            settle_delay: Duration::from_millis(300),
            fallback_interval: Some(Duration::from_secs(60)),
        }
    }
}

struct Running {
    stopping: Arc<AtomicBool>,
    debouncer: Arc<Debouncer>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct EventListenerWorker {
    base: BaseWorker,
    options: EventListenerOptions,
    running: Mutex<Option<Running>>,
}

impl EventListenerWorker {
    pub fn new(
        director: Arc<WorkerDirector>,
        queue: Arc<dyn WorkQueue>,
        options: EventListenerOptions,
    ) -> Self {
        Self {
            base: BaseWorker::new(options.worker_id.clone(), director, queue),
            options,
            running: Mutex::new(None),
        }
    }

    pub fn base(&self) -> &BaseWorker {
        &self.base
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

/// A drain that stops claiming once `stopping` is set.
fn drain(base: BaseWorker, stopping: Arc<AtomicBool>) -> DebouncedFn {
    Arc::new(move || -> BoxedFuture<Result<()>> {
        let base = base.clone();
        let stopping = stopping.clone();
        Box::pin(async move {
            let summary = base
                .process_until(ProcessOptions::now(None), || stopping.load(Ordering::Relaxed))
                .await?;
            if summary.processed > 0 {
                debug!(?summary, "drain complete");
            }
            Ok(())
        })
    })
}

#[async_trait]
impl Worker for EventListenerWorker {
    fn worker_id(&self) -> &str {
        self.base.worker_id()
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!(worker = %self.base.worker_id(), "already started");
            return Ok(());
        }

        // Subscribe before anything else so no event between recovery and
        // the listener spawning is missed.
        let mut events = self.base.queue().subscribe();
        self.base.reset(Utc::now()).await?;

        let stopping = Arc::new(AtomicBool::new(false));
        let debouncer = Arc::new(Debouncer::new(
            "event_listener",
            self.options.debounce,
            drain(self.base.clone(), stopping.clone()),
        ));
        let span = info_span!("event_listener", worker = %self.base.worker_id());
        let mut tasks = Vec::with_capacity(3);

        let trigger = debouncer.clone();
        tasks.push(tokio::spawn(
            async move {
                loop {
                    match events.recv().await {
                        Ok(event) if event.wakes_workers() => {
                            debug!(kind = ?event.kind, work_id = %event.work_id, "queue changed");
                            trigger.trigger();
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "event subscriber lagged");
                            trigger.trigger();
                        }
                        Err(RecvError::Closed) => {
                            debug!("event channel closed");
                            break;
                        }
                    }
                }
            }
            .instrument(span.clone()),
        ));

        let base = self.base.clone();
        let settle = self.options.settle_delay;
        tasks.push(tokio::spawn(
            async move {
                tokio::time::sleep(settle).await;
                match base.autoreschedule_types(Utc::now()).await {
                    Ok(ensured) => debug!(count = ensured.len(), "initial reconciliation done"),
                    Err(e) => error!("initial reconciliation failed: {e}"),
                }
            }
            .instrument(span.clone()),
        ));

        if let Some(every) = self.options.fallback_interval {
            let trigger = debouncer.clone();
            tasks.push(tokio::spawn(
                async move {
                    let mut ticker = tokio::time::interval(every);
                    // The first tick completes immediately; the settle pass covers start.
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        trigger.trigger();
                    }
                }
                .instrument(span),
            ));
        }

        info!(worker = %self.base.worker_id(), "event listener started");
        *running = Some(Running {
            stopping,
            debouncer,
            tasks,
        });
        Ok(())
    }

    async fn stop(&self) {
        let Some(Running {
            stopping,
            debouncer,
            tasks,
        }) = self.running.lock().await.take()
        else {
            return;
        };
        // A drain already under way finishes its current item, then claims
        // nothing more.
        stopping.store(true, Ordering::Relaxed);
        debouncer.cancel();
        for task in tasks {
            task.abort();
        }
        info!(worker = %self.base.worker_id(), "event listener stopped");
    }
}
