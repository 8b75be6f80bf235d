use std::collections::{BTreeMap, HashMap};

use base64::Engine as _;
use chrono::Utc;
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use alya_schemas::{BatchRow, ClaimedRow, NewRow, ProcessorMessage, RowStatus};

use crate::error::{StoreError, StoreResult};

const B64: base64::engine::general_purpose::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// §4.A `InsertRows` / the insert half of `AppendRows`. Fails atomically
/// (no rows inserted) if the batch is terminal or if any `(batch_id, line)`
/// collides with an existing row. Returns the batch's new total row count.
pub async fn insert_rows(
    pool: &PgPool,
    batch_id: Uuid,
    rows: &[NewRow],
    visibility_hold: Option<chrono::Duration>,
) -> StoreResult<i64> {
    let mut tx = pool.begin().await?;

    let locked = sqlx::query(
        "select submitted_at, status from batches where batch_id = $1 for update",
    )
    .bind(batch_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::NotFound)?;

    let submitted_at: chrono::DateTime<Utc> = locked.try_get("submitted_at")?;
    let status: String = locked.try_get("status")?;
    let status: alya_schemas::BatchStatus = status
        .parse()
        .map_err(|_| StoreError::StoreUnavailable("corrupt status column".into()))?;
    if status.is_terminal() {
        tx.rollback().await?;
        return Err(StoreError::AlreadyTerminal);
    }

    let visible_after = match visibility_hold {
        Some(h) => submitted_at + h,
        None => submitted_at,
    };

    for row in rows {
        sqlx::query(
            r#"
            insert into batch_rows
                (batch_id, line, status, input, batch_submitted_at, visible_after)
            values ($1, $2, 'queued', $3, $4, $5)
            "#,
        )
        .bind(batch_id)
        .bind(row.line)
        .bind(&row.input)
        .bind(submitted_at)
        .bind(visible_after)
        .execute(&mut *tx)
        .await?;
    }

    let (total,): (i64,) =
        sqlx::query_as("select count(*) from batch_rows where batch_id = $1")
            .bind(batch_id)
            .fetch_one(&mut *tx)
            .await?;

    sqlx::query("update batches set row_count = $2 where batch_id = $1")
        .bind(batch_id)
        .bind(total)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(total)
}

/// §4.G row claimer, backing §4.A `ClaimNextRow`.
///
/// `FOR UPDATE SKIP LOCKED` on the candidate-selection CTE means concurrent
/// claimers never observe, let alone double-claim, the same row — the
/// first to lock it wins, everyone else's scan simply skips past it.
pub async fn claim_next_row(pool: &PgPool, worker_id: &str) -> StoreResult<Option<ClaimedRow>> {
    let row = sqlx::query(
        r#"
        with candidate as (
            select r.batch_id, r.line
            from batch_rows r
            where r.status = 'queued'
              and r.visible_after <= now()
            order by r.batch_submitted_at asc, r.line asc
            limit 1
            for update skip locked
        ),
        claimed as (
            update batch_rows br
               set status = 'in_progress', started_at = now(), worker_id = $1
              from candidate c
             where br.batch_id = c.batch_id and br.line = c.line
            returning br.batch_id, br.line, br.input
        )
        select c.batch_id, c.line, c.input, b.app, b.op, b.kind, b.batch_ctx
        from claimed c
        join batches b on b.batch_id = c.batch_id
        "#,
    )
    .bind(worker_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };

    let kind: String = row.try_get("kind")?;
    let kind: alya_schemas::RequestKind = kind
        .parse()
        .map_err(|_| StoreError::StoreUnavailable("corrupt kind column".into()))?;

    Ok(Some(ClaimedRow {
        batch_id: row.try_get("batch_id")?,
        line: row.try_get("line")?,
        app: row.try_get("app")?,
        op: row.try_get("op")?,
        kind,
        batch_ctx: row.try_get("batch_ctx")?,
        input: row.try_get("input")?,
    }))
}

/// §4.A `FinalizeRow`: terminal transition. Rejects (returns `Conflict`) if
/// the row is not currently `in_progress` — e.g. it was already finalized,
/// or recovery already reset it back to `queued`.
pub async fn finalize_row(
    pool: &PgPool,
    batch_id: Uuid,
    line: i64,
    status: RowStatus,
    result: Value,
    messages: &[ProcessorMessage],
    blob_rows: &BTreeMap<String, Vec<u8>>,
) -> StoreResult<()> {
    if status.is_terminal() {
        // fine
    } else {
        return Err(StoreError::Conflict);
    }

    let messages_json = serde_json::to_value(messages)
        .map_err(|e| StoreError::StoreUnavailable(format!("serialize messages: {e}")))?;
    let blobs_b64: BTreeMap<String, String> = blob_rows
        .iter()
        .map(|(k, v)| (k.clone(), B64.encode(v)))
        .collect();
    let blobs_json = serde_json::to_value(&blobs_b64)
        .map_err(|e| StoreError::StoreUnavailable(format!("serialize blob_rows: {e}")))?;

    let updated = sqlx::query(
        r#"
        update batch_rows
           set status = $3, result = $4, messages = $5, blob_rows = $6, completed_at = now(),
               worker_id = null
         where batch_id = $1
           and line = $2
           and status = 'in_progress'
        returning line
        "#,
    )
    .bind(batch_id)
    .bind(line)
    .bind(status.to_string())
    .bind(result)
    .bind(messages_json)
    .bind(blobs_json)
    .fetch_optional(pool)
    .await?;

    match updated {
        Some(_) => Ok(()),
        None => Err(StoreError::Conflict),
    }
}

/// §4.A / §4.I `ResetRows`: flips each listed `in_progress` row owned by
/// `worker_id` back to `queued`, clearing owner/started_at. The only
/// mechanism, besides abort, that returns a row to the queue (§4.I).
///
/// Filtering on `worker_id` (not just `status = 'in_progress'`) matters
/// because §4.I allows concurrent sweepers: a row read from a dead
/// worker's tracked-row set may, by the time this runs, already have been
/// reclaimed and be actively owned by a different, live worker. Without
/// the owner check a stale sweep would reset that row out from under its
/// new, legitimate owner, letting a third worker claim and process it
/// again.
pub async fn reset_rows(pool: &PgPool, worker_id: &str, rows: &[(Uuid, i64)]) -> StoreResult<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let batch_ids: Vec<Uuid> = rows.iter().map(|(b, _)| *b).collect();
    let lines: Vec<i64> = rows.iter().map(|(_, l)| *l).collect();

    let affected = sqlx::query(
        r#"
        update batch_rows br
           set status = 'queued', started_at = null, worker_id = null
          from unnest($1::uuid[], $2::bigint[]) as t(batch_id, line)
         where br.batch_id = t.batch_id
           and br.line = t.line
           and br.status = 'in_progress'
           and br.worker_id = $3
        "#,
    )
    .bind(&batch_ids)
    .bind(&lines)
    .bind(worker_id)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(affected)
}

/// §4.A `CountRowsByStatus`.
pub async fn count_rows_by_status(
    pool: &PgPool,
    batch_id: Uuid,
) -> StoreResult<HashMap<RowStatus, i64>> {
    let rows = sqlx::query(
        "select status, count(*) as n from batch_rows where batch_id = $1 group by status",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;

    let mut out = HashMap::new();
    for row in rows {
        let status: String = row.try_get("status")?;
        let status: RowStatus = status
            .parse()
            .map_err(|_| StoreError::StoreUnavailable("corrupt status column".into()))?;
        out.insert(status, row.try_get("n")?);
    }
    Ok(out)
}

/// §4.A `ListRows` (paged).
pub async fn list_rows(
    pool: &PgPool,
    batch_id: Uuid,
    limit: i64,
    offset: i64,
) -> StoreResult<Vec<BatchRow>> {
    let rows = sqlx::query(
        r#"
        select batch_id, line, status, input, result, messages, started_at, completed_at
        from batch_rows
        where batch_id = $1
        order by line asc
        limit $2 offset $3
        "#,
    )
    .bind(batch_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_batch_row).collect()
}

fn row_to_batch_row(row: &sqlx::postgres::PgRow) -> StoreResult<BatchRow> {
    let status: String = row.try_get("status")?;
    let messages_json: Value = row.try_get("messages")?;
    let messages: Vec<ProcessorMessage> = serde_json::from_value(messages_json)
        .map_err(|e| StoreError::StoreUnavailable(format!("deserialize messages: {e}")))?;

    Ok(BatchRow {
        batch_id: row.try_get("batch_id")?,
        line: row.try_get("line")?,
        status: status
            .parse()
            .map_err(|_| StoreError::StoreUnavailable("corrupt status column".into()))?,
        input: row.try_get("input")?,
        result: row.try_get("result")?,
        messages,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

/// Rows of `batch_id`, in ascending line order, carrying only the blob-row
/// payloads — the summarizer's input for deterministic blob concatenation
/// (§4.H step 3, §5 ordering guarantee).
pub async fn list_blob_rows_ordered(
    pool: &PgPool,
    batch_id: Uuid,
) -> StoreResult<Vec<(i64, BTreeMap<String, Vec<u8>>)>> {
    let rows = sqlx::query(
        "select line, blob_rows from batch_rows where batch_id = $1 order by line asc",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let line: i64 = row.try_get("line")?;
        let blobs_json: Value = row.try_get("blob_rows")?;
        let blobs_b64: BTreeMap<String, String> = serde_json::from_value(blobs_json)
            .map_err(|e| StoreError::StoreUnavailable(format!("deserialize blob_rows: {e}")))?;
        let mut blobs = BTreeMap::new();
        for (name, encoded) in blobs_b64 {
            let bytes = B64
                .decode(encoded)
                .map_err(|e| StoreError::StoreUnavailable(format!("decode blob_rows: {e}")))?;
            blobs.insert(name, bytes);
        }
        out.push((line, blobs));
    }
    Ok(out)
}
