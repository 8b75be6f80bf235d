use chrono::Utc;
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use alya_schemas::{BatchCounters, BatchRecord, BatchStatus, RequestKind};

use crate::error::{StoreError, StoreResult};

/// Arguments for `insert_batch` (§4.A `InsertBatch`).
pub struct NewBatch {
    pub app: String,
    pub op: String,
    pub kind: RequestKind,
    pub batch_ctx: Value,
    /// When set, the batch's rows are not claimable until `now() + hold`
    /// (the `wait_a_bit` implementation hint in §4.E).
    pub visibility_hold: Option<chrono::Duration>,
}

/// Insert a new batch record in `queued` status. Returns the generated id.
pub async fn insert_batch(pool: &PgPool, new: &NewBatch) -> StoreResult<Uuid> {
    let batch_id = Uuid::new_v4();
    sqlx::query(
        r#"
        insert into batches (batch_id, app, op, kind, status, batch_ctx, submitted_at)
        values ($1, $2, $3, $4, 'queued', $5, now())
        "#,
    )
    .bind(batch_id)
    .bind(&new.app)
    .bind(&new.op)
    .bind(new.kind.to_string())
    .bind(&new.batch_ctx)
    .execute(pool)
    .await?;

    Ok(batch_id)
}

/// `visible_after` timestamp new rows of this batch should carry, derived
/// from the batch's `visibility_hold`. Exposed so `insert_rows`/`append_rows`
/// can honor the same hold window regardless of which call created the row.
pub async fn visible_after_for_batch(
    pool: &PgPool,
    batch_id: Uuid,
    hold: Option<chrono::Duration>,
) -> StoreResult<chrono::DateTime<Utc>> {
    let (submitted_at,): (chrono::DateTime<Utc>,) =
        sqlx::query_as("select submitted_at from batches where batch_id = $1")
            .bind(batch_id)
            .fetch_optional(pool)
            .await?
            .ok_or(StoreError::NotFound)?;

    Ok(match hold {
        Some(h) => submitted_at + h,
        None => submitted_at,
    })
}

/// Fetch a single batch record.
pub async fn get_batch(pool: &PgPool, batch_id: Uuid) -> StoreResult<BatchRecord> {
    let row = sqlx::query(
        r#"
        select batch_id, app, op, kind, status, batch_ctx, n_success, n_failed, n_aborted,
               submitted_at, started_at, completed_at, output_files, result, row_count
        from batches
        where batch_id = $1
        "#,
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound)?;

    row_to_batch(&row)
}

fn row_to_batch(row: &sqlx::postgres::PgRow) -> StoreResult<BatchRecord> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(BatchRecord {
        batch_id: row.try_get("batch_id")?,
        app: row.try_get("app")?,
        op: row.try_get("op")?,
        kind: kind
            .parse()
            .map_err(|_| StoreError::StoreUnavailable("corrupt kind column".into()))?,
        status: status
            .parse()
            .map_err(|_| StoreError::StoreUnavailable("corrupt status column".into()))?,
        batch_ctx: row.try_get("batch_ctx")?,
        counters: BatchCounters {
            n_success: row.try_get("n_success")?,
            n_failed: row.try_get("n_failed")?,
            n_aborted: row.try_get("n_aborted")?,
        },
        submitted_at: row.try_get("submitted_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        output_files: row.try_get("output_files")?,
        result: row.try_get("result")?,
        row_count: row.try_get("row_count")?,
    })
}

/// §4.A `MarkBatchStarted`: queued -> in_progress, idempotent no-op if
/// already started.
pub async fn mark_batch_started(pool: &PgPool, batch_id: Uuid) -> StoreResult<()> {
    sqlx::query(
        r#"
        update batches
           set status = 'in_progress', started_at = coalesce(started_at, now())
         where batch_id = $1
           and status = 'queued'
        "#,
    )
    .bind(batch_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// §4.A `AbortBatch`: one transaction flips every non-terminal row to
/// aborted and the batch itself to aborted.
pub async fn abort_batch(pool: &PgPool, batch_id: Uuid) -> StoreResult<()> {
    let mut tx = pool.begin().await?;

    let aborted_rows = sqlx::query(
        r#"
        update batch_rows
           set status = 'aborted', completed_at = now()
         where batch_id = $1
           and status in ('queued', 'in_progress')
        "#,
    )
    .bind(batch_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let counts = sqlx::query(
        r#"
        select
            count(*) filter (where status = 'success') as n_success,
            count(*) filter (where status = 'failed') as n_failed,
            count(*) filter (where status = 'aborted') as n_aborted
        from batch_rows
        where batch_id = $1
        "#,
    )
    .bind(batch_id)
    .fetch_one(&mut *tx)
    .await?;

    let n_success: i64 = counts.try_get("n_success")?;
    let n_failed: i64 = counts.try_get("n_failed")?;
    let n_aborted: i64 = counts.try_get("n_aborted")?;

    let updated = sqlx::query(
        r#"
        update batches
           set status = 'aborted',
               n_success = $2,
               n_failed = $3,
               n_aborted = $4,
               completed_at = now()
         where batch_id = $1
           and status not in ('success', 'failed', 'aborted')
        returning batch_id
        "#,
    )
    .bind(batch_id)
    .bind(n_success)
    .bind(n_failed)
    .bind(n_aborted)
    .fetch_optional(&mut *tx)
    .await?;

    if updated.is_none() {
        // Batch was already terminal; nothing to abort. Roll back the row
        // flips above so a concurrent abort doesn't corrupt a finished batch.
        tx.rollback().await?;
        return Err(StoreError::AlreadyTerminal);
    }

    let _ = aborted_rows;
    tx.commit().await?;
    Ok(())
}

/// §4.A `ListBatchesMissedSummary`: batches whose rows are all terminal but
/// whose own status is still `in_progress` — the sweeper's rescue target.
pub async fn list_batches_missed_summary(pool: &PgPool) -> StoreResult<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"
        select b.batch_id
        from batches b
        where b.status = 'in_progress'
          and exists (select 1 from batch_rows r where r.batch_id = b.batch_id)
          and not exists (
              select 1 from batch_rows r
              where r.batch_id = b.batch_id
                and r.status not in ('success', 'failed', 'aborted')
          )
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(|r| r.try_get::<Uuid, _>("batch_id").map_err(Into::into)).collect()
}
