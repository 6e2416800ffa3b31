//! Query filters and allocation statistics for the administrative surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::work::{Status, Work};

/// Filter for listing and counting work items.
#[derive(Debug, Clone, Default)]
pub struct WorkFilter {
    pub types: Option<Vec<String>>,
    pub statuses: Option<Vec<Status>>,
    pub schedule_id: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl WorkFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn work_type(mut self, work_type: impl Into<String>) -> Self {
        self.types.get_or_insert_with(Vec::new).push(work_type.into());
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.statuses.get_or_insert_with(Vec::new).push(status);
        self
    }

    pub fn schedule_id(mut self, id: impl Into<String>) -> Self {
        self.schedule_id = Some(id.into());
        self
    }

    pub fn created_between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.created_from = Some(from);
        self.created_to = Some(to);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Ignores `limit`/`offset`; those apply to the sorted result set.
    pub fn matches(&self, work: &Work) -> bool {
        if let Some(ref types) = self.types
            && !types.iter().any(|t| *t == work.work_type)
        {
            return false;
        }
        if let Some(ref statuses) = self.statuses
            && !statuses.contains(&work.status)
        {
            return false;
        }
        if let Some(ref id) = self.schedule_id
            && work.schedule_id.as_deref() != Some(id.as_str())
        {
            return false;
        }
        if self.created_from.is_some_and(|from| work.created < from) {
            return false;
        }
        if self.created_to.is_some_and(|to| work.created > to) {
            return false;
        }
        true
    }

    pub(crate) fn status_strings(&self) -> Option<Vec<String>> {
        self.statuses
            .as_ref()
            .map(|s| s.iter().map(|s| s.to_string()).collect())
    }
}

/// Filter for [`WorkReport`] aggregation.
#[derive(Debug, Clone, Default)]
pub struct ReportFilter {
    pub types: Option<Vec<String>>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl ReportFilter {
    pub(crate) fn matches(&self, work: &Work) -> bool {
        WorkFilter {
            types: self.types.clone(),
            created_from: self.from,
            created_to: self.to,
            ..WorkFilter::default()
        }
        .matches(work)
    }
}

/// Allocation statistics for one work type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkReport {
    pub work_type: String,
    pub new: u64,
    pub allocated: u64,
    pub success: u64,
    pub failed: u64,
    pub deleted: u64,
    /// Mean started→finished time over finished attempts.
    pub avg_duration_ms: Option<f64>,
}

impl WorkReport {
    pub fn total(&self) -> u64 {
        self.new + self.allocated + self.success + self.failed + self.deleted
    }

    /// Fold a set of items into per-type reports, sorted by type.
    pub fn aggregate<'a>(items: impl IntoIterator<Item = &'a Work>) -> Vec<WorkReport> {
        let mut by_type: std::collections::BTreeMap<&str, (WorkReport, i64, u64)> =
            std::collections::BTreeMap::new();

        for work in items {
            let (report, total_ms, finished) =
                by_type.entry(work.work_type.as_str()).or_insert_with(|| {
                    (
                        WorkReport {
                            work_type: work.work_type.clone(),
                            ..WorkReport::default()
                        },
                        0,
                        0,
                    )
                });
            match work.status {
                Status::New => report.new += 1,
                Status::Allocated => report.allocated += 1,
                Status::Success => report.success += 1,
                Status::Failed => report.failed += 1,
                Status::Deleted => report.deleted += 1,
            }
            if matches!(work.status, Status::Success | Status::Failed)
                && let Some(ms) = work.duration_ms()
            {
                *total_ms += ms;
                *finished += 1;
            }
        }

        by_type
            .into_values()
            .map(|(mut report, total_ms, finished)| {
                if finished > 0 {
                    report.avg_duration_ms = Some(total_ms as f64 / finished as f64);
                }
                report
            })
            .collect()
    }
}
