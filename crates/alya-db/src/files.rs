use serde_json::Value;
use sqlx::Row;
use sqlx::PgPool;
use uuid::Uuid;

use alya_schemas::{BatchCounters, BatchFile, BatchStatus};

use crate::error::{StoreError, StoreResult};

/// Outcome of a `finalize_batch_summary` attempt (§4.H step 5).
#[derive(Debug, PartialEq, Eq)]
pub enum SummaryOutcome {
    /// This call recorded the batch's terminal counters/files; the caller's
    /// uploaded objects are authoritative.
    Won,
    /// Another summarizer already finalized this batch first; the caller
    /// must best-effort delete the objects it just uploaded.
    LostRace,
    /// Rows appeared (via `AppendRows`) since the caller counted them;
    /// nothing was written, try again after re-reading row counts.
    NotReady,
}

/// §4.H, one-shot race-safe batch finalization. Re-checks batch terminality
/// and row completeness inside the *same* transaction that records the
/// batch_files rows and the batch's terminal status, satisfying invariant 6.
///
/// `result` is the slow-query result payload (§3: "optional result payload
/// (slow-query only)"); batch-kind callers pass `None` since `batches.result`
/// has no meaning outside a single-row slow query.
pub async fn finalize_batch_summary(
    pool: &PgPool,
    batch_id: Uuid,
    status: BatchStatus,
    counters: BatchCounters,
    files: &[BatchFile],
    result: Option<Value>,
) -> StoreResult<SummaryOutcome> {
    let mut tx = pool.begin().await?;

    let current = sqlx::query("select status from batches where batch_id = $1 for update")
        .bind(batch_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound)?;

    let current_status: String = current.try_get("status")?;
    let current_status: BatchStatus = current_status
        .parse()
        .map_err(|_| StoreError::StoreUnavailable("corrupt status column".into()))?;
    if current_status.is_terminal() {
        tx.rollback().await?;
        return Ok(SummaryOutcome::LostRace);
    }

    let (non_terminal,): (i64,) = sqlx::query_as(
        r#"
        select count(*) from batch_rows
        where batch_id = $1 and status not in ('success', 'failed', 'aborted')
        "#,
    )
    .bind(batch_id)
    .fetch_one(&mut *tx)
    .await?;

    if non_terminal > 0 {
        tx.rollback().await?;
        return Ok(SummaryOutcome::NotReady);
    }

    for file in files {
        sqlx::query(
            r#"
            insert into batch_files (batch_id, name, object_key, size_bytes, content_type)
            values ($1, $2, $3, $4, $5)
            on conflict (batch_id, name) do nothing
            "#,
        )
        .bind(batch_id)
        .bind(&file.name)
        .bind(&file.object_key)
        .bind(file.size_bytes)
        .bind(&file.content_type)
        .execute(&mut *tx)
        .await?;
    }

    let output_files: std::collections::BTreeMap<&str, &str> = files
        .iter()
        .map(|f| (f.name.as_str(), f.object_key.as_str()))
        .collect();
    let output_files_json = serde_json::to_value(&output_files)
        .map_err(|e| StoreError::StoreUnavailable(format!("serialize output_files: {e}")))?;

    let updated = sqlx::query(
        r#"
        update batches
           set status = $2, n_success = $3, n_failed = $4, n_aborted = $5,
               output_files = $6, result = $7, completed_at = now()
         where batch_id = $1
           and status not in ('success', 'failed', 'aborted')
        returning batch_id
        "#,
    )
    .bind(batch_id)
    .bind(status.to_string())
    .bind(counters.n_success)
    .bind(counters.n_failed)
    .bind(counters.n_aborted)
    .bind(output_files_json)
    .bind(result)
    .fetch_optional(&mut *tx)
    .await?;

    if updated.is_none() {
        tx.rollback().await?;
        return Ok(SummaryOutcome::LostRace);
    }

    tx.commit().await?;
    Ok(SummaryOutcome::Won)
}

/// Artifacts recorded for a completed batch.
pub async fn list_batch_files(pool: &PgPool, batch_id: Uuid) -> StoreResult<Vec<BatchFile>> {
    let rows = sqlx::query(
        "select batch_id, name, object_key, size_bytes, content_type from batch_files where batch_id = $1 order by name asc",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(BatchFile {
                batch_id: row.try_get("batch_id")?,
                name: row.try_get("name")?,
                object_key: row.try_get("object_key")?,
                size_bytes: row.try_get("size_bytes")?,
                content_type: row.try_get("content_type")?,
            })
        })
        .collect()
}
