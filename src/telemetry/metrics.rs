//! Metric instruments, created on demand from the global `"workd"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter(super::SERVICE_NAME)
}

/// Items inserted. Requeues count under `workd.work.finished`. Labels: `work_type`.
pub fn work_added() -> Counter<u64> {
    meter()
        .u64_counter("workd.work.added")
        .with_description("Work items added to the queue")
        .build()
}

/// Successful claims. Labels: `work_type`.
pub fn work_allocated() -> Counter<u64> {
    meter()
        .u64_counter("workd.work.allocated")
        .with_description("Work items claimed by a worker")
        .build()
}

/// Recorded attempt outcomes. Labels: `work_type`, `status`.
pub fn work_finished() -> Counter<u64> {
    meter()
        .u64_counter("workd.work.finished")
        .with_description("Work attempts finished")
        .build()
}

/// Orphans failed by startup recovery. Labels: `work_type`.
pub fn work_recovered() -> Counter<u64> {
    meter()
        .u64_counter("workd.work.recovered")
        .with_description("Orphaned allocations marked as failed")
        .build()
}

/// Drain cycles run. Labels: `worker`.
pub fn worker_cycles() -> Counter<u64> {
    meter()
        .u64_counter("workd.worker.cycles")
        .with_description("Worker drain cycles")
        .build()
}

/// Adapter execution time. Labels: `work_type`.
pub fn work_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workd.work.duration_ms")
        .with_description("Work execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
