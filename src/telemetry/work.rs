//! Spans around a single work execution.

use tracing::Span;

use crate::model::WorkId;

/// `work.state` starts empty and is filled by [`record_state_transition`].
pub fn start_work_span(work_type: &str, work_id: &WorkId, worker: &str) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.type" = work_type,
        "work.id" = %work_id,
        "work.worker" = worker,
        "work.state" = tracing::field::Empty,
    )
}

pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("work.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
