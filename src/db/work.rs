//! `WorkQueue` on Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::PgConnection;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::Db;
use super::notify::notify;
use crate::error::{Error, Result};
use crate::event::{WorkEvent, WorkEventKind};
use crate::model::*;
use crate::queue::{WorkQueue, require_schedule_id};
use crate::telemetry::metrics;

macro_rules! columns {
    () => {
        "id, work_type, input, priority, scheduled, retries, attempts, status, worker, \
         started, finished, result, error, original_work_id, schedule_id, timeout_ms, \
         created, updated, deleted"
    };
}

/// Nullable filter parameters shared by list and count: `$1` types,
/// `$2` statuses, `$3` schedule id, `$4`/`$5` created bounds.
macro_rules! filter_clause {
    () => {
        " WHERE ($1::text[] IS NULL OR work_type = ANY($1)) \
           AND ($2::text[] IS NULL OR status = ANY($2)) \
           AND ($3::text IS NULL OR schedule_id = $3) \
           AND ($4::timestamptz IS NULL OR created >= $4) \
           AND ($5::timestamptz IS NULL OR created <= $5)"
    };
}

async fn insert(conn: &mut PgConnection, work: &Work, on_conflict: bool) -> Result<Option<Work>> {
    let sql = if on_conflict {
        concat!(
            "INSERT INTO work (",
            columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19) \
             ON CONFLICT (schedule_id) WHERE status = 'NEW' AND schedule_id IS NOT NULL DO NOTHING \
             RETURNING ",
            columns!()
        )
    } else {
        concat!(
            "INSERT INTO work (",
            columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19) \
             RETURNING ",
            columns!()
        )
    };

    let row: Option<WorkRow> = sqlx::query_as(sql)
        .bind(work.id.0)
        .bind(&work.work_type)
        .bind(&work.input)
        .bind(work.priority)
        .bind(work.scheduled)
        .bind(work.retries as i32)
        .bind(work.attempts as i32)
        .bind(work.status.as_str())
        .bind(&work.worker)
        .bind(work.started)
        .bind(work.finished)
        .bind(&work.result)
        .bind(&work.error)
        .bind(work.original_work_id.map(|id| id.0))
        .bind(&work.schedule_id)
        .bind(work.timeout_ms.map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)))
        .bind(work.created)
        .bind(work.updated)
        .bind(work.deleted)
        .fetch_optional(&mut *conn)
        .await?;

    row.map(WorkRow::try_into_work).transpose()
}

async fn lock_one(conn: &mut PgConnection, id: WorkId) -> Result<Work> {
    let row: Option<WorkRow> = sqlx::query_as(concat!(
        "SELECT ",
        columns!(),
        " FROM work WHERE id = $1 FOR UPDATE"
    ))
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await?;

    row.ok_or_else(|| Error::NotFound(format!("work item {id}")))?
        .try_into_work()
}

/// Soft-delete pending items of a schedule, except `keep`.
async fn delete_pending(
    conn: &mut PgConnection,
    schedule_id: &str,
    work_type: Option<&str>,
    keep: Option<WorkId>,
    now: DateTime<Utc>,
) -> Result<Vec<Work>> {
    let rows: Vec<WorkRow> = sqlx::query_as(concat!(
        "UPDATE work SET status = 'DELETED', deleted = $1, updated = $1 \
         WHERE status = 'NEW' AND schedule_id = $2 \
           AND ($3::text IS NULL OR work_type = $3) \
           AND ($4::uuid IS NULL OR id <> $4) \
         RETURNING ",
        columns!()
    ))
    .bind(now)
    .bind(schedule_id)
    .bind(work_type)
    .bind(keep.map(|id| id.0))
    .fetch_all(&mut *conn)
    .await?;

    let removed = rows
        .into_iter()
        .map(WorkRow::try_into_work)
        .collect::<Result<Vec<_>>>()?;
    for work in &removed {
        notify(conn, WorkEventKind::Deleted, work).await?;
    }
    Ok(removed)
}

fn record_added(work: &Work) {
    metrics::work_added().add(1, &[KeyValue::new("work_type", work.work_type.clone())]);
}

#[async_trait]
impl WorkQueue for Db {
    async fn add_work(&self, new: NewWork) -> Result<Work> {
        new.validate()?;
        let mut tx = self.pool.begin().await?;
        let work = insert(&mut tx, &new.into_work(Utc::now()), false)
            .await?
            .ok_or_else(|| Error::Other("insert returned no row".to_string()))?;
        notify(&mut tx, WorkEventKind::Added, &work).await?;
        tx.commit().await?;

        record_added(&work);
        Ok(work)
    }

    async fn ensure_one_work(&self, new: NewWork) -> Result<Work> {
        new.validate()?;
        let schedule_id = require_schedule_id(&new)?.to_string();

        // Two rounds cover the race where the conflicting row is claimed
        // between the insert and the update.
        for _ in 0..2 {
            let now = Utc::now();
            let candidate = new.clone().into_work(now);
            let mut tx = self.pool.begin().await?;

            if let Some(work) = insert(&mut tx, &candidate, true).await? {
                notify(&mut tx, WorkEventKind::Added, &work).await?;
                tx.commit().await?;
                record_added(&work);
                return Ok(work);
            }

            let existing: Option<WorkRow> = sqlx::query_as(concat!(
                "UPDATE work SET \
                   updated = CASE WHEN $2 < scheduled THEN $3 ELSE updated END, \
                   scheduled = LEAST(scheduled, $2) \
                 WHERE status = 'NEW' AND schedule_id = $1 \
                 RETURNING ",
                columns!()
            ))
            .bind(&schedule_id)
            .bind(candidate.scheduled)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;
            tx.commit().await?;

            if let Some(row) = existing {
                return row.try_into_work();
            }
        }

        Err(Error::Other(format!(
            "could not ensure pending work for schedule {schedule_id}"
        )))
    }

    async fn ensure_no_work(&self, work_type: &str, schedule_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = delete_pending(&mut tx, schedule_id, Some(work_type), None, Utc::now()).await?;
        tx.commit().await?;
        Ok(removed.len() as u64)
    }

    async fn allocate_work(&self, request: &AllocateWork) -> Result<Option<Work>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row: Option<WorkRow> = sqlx::query_as(concat!(
            "UPDATE work SET status = 'ALLOCATED', worker = $2, started = $3, finished = NULL, \
               attempts = attempts + 1, updated = $3 \
             WHERE id = ( \
               SELECT id FROM work \
               WHERE work_type = ANY($1) \
                 AND ((status = 'NEW' AND scheduled <= $3) \
                   OR (status = 'ALLOCATED' AND timeout_ms IS NOT NULL \
                       AND started + timeout_ms * interval '1 millisecond' < $3)) \
               ORDER BY priority DESC, scheduled ASC, created ASC, seq ASC \
               LIMIT 1 \
               FOR UPDATE SKIP LOCKED) \
             RETURNING ",
            columns!()
        ))
        .bind(&request.types)
        .bind(&request.worker)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let work = row.try_into_work()?;
        notify(&mut tx, WorkEventKind::Allocated, &work).await?;
        tx.commit().await?;

        metrics::work_allocated().add(1, &[KeyValue::new("work_type", work.work_type.clone())]);
        Ok(Some(work))
    }

    async fn find_work(&self, id: WorkId) -> Result<Option<Work>> {
        let row: Option<WorkRow> =
            sqlx::query_as(concat!("SELECT ", columns!(), " FROM work WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(WorkRow::try_into_work).transpose()
    }

    async fn find_work_queue(&self, filter: &WorkFilter) -> Result<Vec<Work>> {
        let rows: Vec<WorkRow> = sqlx::query_as(concat!(
            "SELECT ",
            columns!(),
            " FROM work",
            filter_clause!(),
            " ORDER BY created DESC, seq DESC LIMIT $6 OFFSET $7"
        ))
        .bind(&filter.types)
        .bind(filter.status_strings())
        .bind(&filter.schedule_id)
        .bind(filter.created_from)
        .bind(filter.created_to)
        .bind(filter.limit.map(|l| l as i64))
        .bind(filter.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkRow::try_into_work).collect()
    }

    async fn count(&self, filter: &WorkFilter) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as(concat!("SELECT COUNT(*) FROM work", filter_clause!()))
                .bind(&filter.types)
                .bind(filter.status_strings())
                .bind(&filter.schedule_id)
                .bind(filter.created_from)
                .bind(filter.created_to)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn finish_work(&self, id: WorkId, finish: FinishWork) -> Result<Work> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let mut work = lock_one(&mut tx, id).await?;
        if work.status != Status::Allocated || work.worker.as_deref() != Some(&finish.worker) {
            return Err(Error::LeaseLost {
                id: id.to_string(),
                worker: finish.worker,
            });
        }

        work.status = match finish.retry_at {
            _ if finish.success => Status::Success,
            Some(at) if work.retries > 0 => {
                work.retries -= 1;
                work.scheduled = at;
                Status::New
            }
            _ => Status::Failed,
        };

        // Free the schedule's pending slot before this item takes it.
        if work.status == Status::New
            && let Some(ref schedule_id) = work.schedule_id
        {
            delete_pending(&mut tx, schedule_id, None, Some(id), now).await?;
        }

        let row: WorkRow = sqlx::query_as(concat!(
            "UPDATE work SET status = $2, retries = $3, scheduled = $4, result = $5, error = $6, \
               started = $7, finished = $8, updated = $9 \
             WHERE id = $1 RETURNING ",
            columns!()
        ))
        .bind(id.0)
        .bind(work.status.as_str())
        .bind(work.retries as i32)
        .bind(work.scheduled)
        .bind(&finish.result)
        .bind(&finish.error)
        .bind(finish.started)
        .bind(finish.finished)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let work = row.try_into_work()?;

        notify(&mut tx, WorkEventKind::Finished, &work).await?;
        tx.commit().await?;

        metrics::work_finished().add(
            1,
            &[
                KeyValue::new("work_type", work.work_type.clone()),
                KeyValue::new("status", work.status.to_string()),
            ],
        );
        Ok(work)
    }

    async fn delete_work(&self, id: WorkId) -> Result<Work> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let current = lock_one(&mut tx, id).await?;
        if !current.status.can_transition_to(Status::Deleted) {
            return Err(Error::InvalidTransition {
                from: current.status.to_string(),
                to: Status::Deleted.to_string(),
            });
        }

        let row: WorkRow = sqlx::query_as(concat!(
            "UPDATE work SET status = 'DELETED', deleted = $2, updated = $2 WHERE id = $1 RETURNING ",
            columns!()
        ))
        .bind(id.0)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let work = row.try_into_work()?;

        notify(&mut tx, WorkEventKind::Deleted, &work).await?;
        tx.commit().await?;
        Ok(work)
    }

    async fn mark_old_work_as_failed(&self, request: &MarkOldWork) -> Result<Vec<Work>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let rows: Vec<WorkRow> = sqlx::query_as(concat!(
            "SELECT ",
            columns!(),
            " FROM work \
             WHERE status = 'ALLOCATED' AND work_type = ANY($1) \
               AND ($2::text IS NULL OR worker = $2) \
               AND started < $3 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(&request.types)
        .bind(&request.worker)
        .bind(request.reference_date)
        .fetch_all(&mut *tx)
        .await?;

        let mut recovered = Vec::with_capacity(rows.len());
        for row in rows {
            let orphan = row.try_into_work()?;
            let row: WorkRow = sqlx::query_as(concat!(
                "UPDATE work SET status = 'FAILED', finished = $2, error = $3, updated = $2 \
                 WHERE id = $1 RETURNING ",
                columns!()
            ))
            .bind(orphan.id.0)
            .bind(now)
            .bind(orphan_error(orphan.worker.as_deref()))
            .fetch_one(&mut *tx)
            .await?;
            let work = row.try_into_work()?;
            notify(&mut tx, WorkEventKind::Finished, &work).await?;
            recovered.push(work);
        }

        tx.commit().await?;
        Ok(recovered)
    }

    async fn get_report(&self, filter: &ReportFilter) -> Result<Vec<WorkReport>> {
        let rows: Vec<ReportRow> = sqlx::query_as(
            "SELECT work_type,
                    COUNT(*) FILTER (WHERE status = 'NEW') AS new_count,
                    COUNT(*) FILTER (WHERE status = 'ALLOCATED') AS allocated,
                    COUNT(*) FILTER (WHERE status = 'SUCCESS') AS success,
                    COUNT(*) FILTER (WHERE status = 'FAILED') AS failed,
                    COUNT(*) FILTER (WHERE status = 'DELETED') AS deleted,
                    AVG(EXTRACT(EPOCH FROM (finished - started))::float8 * 1000.0)
                        FILTER (WHERE status IN ('SUCCESS', 'FAILED')
                                AND started IS NOT NULL AND finished IS NOT NULL) AS avg_duration_ms
             FROM work
             WHERE ($1::text[] IS NULL OR work_type = ANY($1))
               AND ($2::timestamptz IS NULL OR created >= $2)
               AND ($3::timestamptz IS NULL OR created <= $3)
             GROUP BY work_type
             ORDER BY work_type",
        )
        .bind(&filter.types)
        .bind(filter.from)
        .bind(filter.to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ReportRow::into_report).collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<WorkEvent> {
        self.events.subscribe()
    }
}

#[derive(sqlx::FromRow)]
struct WorkRow {
    id: Uuid,
    work_type: String,
    input: serde_json::Value,
    priority: i32,
    scheduled: DateTime<Utc>,
    retries: i32,
    attempts: i32,
    status: String,
    worker: Option<String>,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    original_work_id: Option<Uuid>,
    schedule_id: Option<String>,
    timeout_ms: Option<i64>,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

impl WorkRow {
    fn try_into_work(self) -> Result<Work> {
        Ok(Work {
            id: WorkId(self.id),
            work_type: self.work_type,
            input: self.input,
            priority: self.priority,
            scheduled: self.scheduled,
            retries: self.retries.max(0) as u32,
            attempts: self.attempts.max(0) as u32,
            status: self.status.parse()?,
            worker: self.worker,
            started: self.started,
            finished: self.finished,
            result: self.result,
            error: self.error,
            original_work_id: self.original_work_id.map(WorkId),
            schedule_id: self.schedule_id,
            timeout_ms: self.timeout_ms.map(|ms| ms.max(0) as u64),
            created: self.created,
            updated: self.updated,
            deleted: self.deleted,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReportRow {
    work_type: String,
    new_count: i64,
    allocated: i64,
    success: i64,
    failed: i64,
    deleted: i64,
    avg_duration_ms: Option<f64>,
}

impl ReportRow {
    fn into_report(self) -> WorkReport {
        WorkReport {
            work_type: self.work_type,
            new: self.new_count as u64,
            allocated: self.allocated as u64,
            success: self.success as u64,
            failed: self.failed as u64,
            deleted: self.deleted as u64,
            avg_duration_ms: self.avg_duration_ms,
        }
    }
}
