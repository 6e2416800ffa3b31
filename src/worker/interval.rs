//! Polls the queue on a fixed period.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span};

use super::{BaseWorker, ProcessOptions, Worker, default_worker_id};
use crate::director::WorkerDirector;
use crate::error::Result;
use crate::queue::WorkQueue;
use crate::schedule::{Schedule, schedule_to_interval};

pub const DEFAULT_SCHEDULE: &str = "every 5 seconds";

#[derive(Debug, Clone)]
pub struct IntervalWorkerOptions {
    pub worker_id: String,
    /// Claims per tick. `None` drains the queue.
    pub batch_count: Option<usize>,
    /// Polling cadence; reduced to a fixed period, capped at one hour.
    pub schedule: Option<Schedule>,
}

impl Default for IntervalWorkerOptions {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            batch_count: None,
            schedule: None,
        }
    }
}

struct Running {
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct IntervalWorker {
    base: BaseWorker,
    period: Duration,
    batch_count: Option<usize>,
    running: Mutex<Option<Running>>,
}

impl IntervalWorker {
    pub fn new(
        director: Arc<WorkerDirector>,
        queue: Arc<dyn WorkQueue>,
        options: IntervalWorkerOptions,
    ) -> Result<Self> {
        let schedule = match options.schedule {
            Some(schedule) => schedule,
            None => Schedule::parse(DEFAULT_SCHEDULE)?,
        };
        let period = schedule_to_interval(&schedule)?;

        Ok(Self {
            base: BaseWorker::new(options.worker_id, director, queue),
            period,
            batch_count: options.batch_count,
            running: Mutex::new(None),
        })
    }

    pub fn base(&self) -> &BaseWorker {
        &self.base
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

#[async_trait]
impl Worker for IntervalWorker {
    fn worker_id(&self) -> &str {
        self.base.worker_id()
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!(worker = %self.base.worker_id(), "already started");
            return Ok(());
        }

        self.base.reset(Utc::now()).await?;

        let shutdown = Arc::new(Notify::new());
        let stopping = Arc::new(AtomicBool::new(false));
        let wake = shutdown.clone();
        let stopped = stopping.clone();
        let base = self.base.clone();
        let period = self.period;
        let batch_count = self.batch_count;
        let span = info_span!("interval_worker", worker = %base.worker_id());

        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = wake.notified() => break,
                        _ = ticker.tick() => {}
                    }
                    // A stop during a cycle ends it after the running item.
                    let cycle = base
                        .process_until(ProcessOptions::now(batch_count), || {
                            stopped.load(Ordering::Relaxed)
                        })
                        .await;
                    match cycle {
                        Ok(summary) if summary.processed > 0 => {
                            debug!(?summary, "cycle complete");
                        }
                        Ok(_) => {}
                        Err(e) => error!("cycle failed: {e}"),
                    }
                }
                debug!("interval loop exited");
            }
            .instrument(span),
        );

        info!(
            worker = %self.base.worker_id(),
            period_ms = self.period.as_millis() as u64,
            "interval worker started"
        );
        *running = Some(Running {
            shutdown,
            stopping,
            handle,
        });
        Ok(())
    }

    async fn stop(&self) {
        let Some(Running {
            shutdown,
            stopping,
            handle,
        }) = self.running.lock().await.take()
        else {
            return;
        };
        stopping.store(true, Ordering::Relaxed);
        shutdown.notify_one();
        if let Err(e) = handle.await {
            error!(worker = %self.base.worker_id(), "interval loop ended abnormally: {e}");
        }
        info!(worker = %self.base.worker_id(), "interval worker stopped");
    }
}
