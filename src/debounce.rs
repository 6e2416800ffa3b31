//! Debounced trigger: collapse bursts of wake-up signals into one delayed,
//! cancellable execution.
//!
//! A single driver task owns the callback, so executions never overlap.
//! Triggers that arrive while the callback is running queue up and open a
//! fresh window once it returns.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::Result;

pub type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Callback run at the end of a quiet window.
pub type DebouncedFn = Arc<dyn Fn() -> BoxedFuture<Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum Signal {
    Trigger,
    Cancel,
}

/// Handle to a debounced callback. Dropping it stops the driver once any
/// running execution finishes.
pub struct Debouncer {
    tx: mpsc::UnboundedSender<Signal>,
    driver: JoinHandle<()>,
}

impl Debouncer {
    /// Spawn the driver task. Must be called within a tokio runtime.
    pub fn new(name: &'static str, delay: Duration, f: DebouncedFn) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(name, delay, f, rx));
        Self { tx, driver }
    }

    /// Start (or restart) the quiet window.
    pub fn trigger(&self) {
        let _ = self.tx.send(Signal::Trigger);
    }

    /// Abort a pending window without running the callback. A running
    /// execution is not interrupted.
    pub fn cancel(&self) {
        let _ = self.tx.send(Signal::Cancel);
    }

    pub fn is_running(&self) -> bool {
        !self.driver.is_finished()
    }
}

async fn drive(
    name: &'static str,
    delay: Duration,
    f: DebouncedFn,
    mut rx: mpsc::UnboundedReceiver<Signal>,
) {
    while let Some(signal) = rx.recv().await {
        if let Signal::Cancel = signal {
            continue;
        }

        // Quiet window: every further trigger restarts it.
        let fire = loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => break true,
                next = rx.recv() => match next {
                    Some(Signal::Trigger) => continue,
                    Some(Signal::Cancel) => break false,
                    None => return,
                },
            }
        };

        if !fire {
            debug!(debouncer = name, "pending execution cancelled");
            continue;
        }

        if let Err(e) = f().await {
            error!(debouncer = name, "debounced execution failed: {e}");
        }
    }
}
