use std::collections::BTreeMap;

use alya_schemas::{BatchCounters, BatchFile, BatchRecord, RequestKind, RowStatus};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::manager::JobManager;

/// §4.H: one-shot, race-safe batch summarization, triggered whenever a
/// worker finalizes a row that turns out to be the batch's last non-terminal
/// one, and retried by the recovery sweeper for batches that were never
/// picked up (§4.I `missed-summary` rescue).
pub async fn summarize(manager: &JobManager, batch_id: Uuid) {
    if let Err(err) = try_summarize(manager, batch_id).await {
        error!(batch_id = %batch_id, error = %err, "summarize failed");
    }
}

async fn try_summarize(manager: &JobManager, batch_id: Uuid) -> anyhow::Result<()> {
    let counts = alya_db::count_rows_by_status(&manager.db, batch_id).await?;
    let n_success = *counts.get(&RowStatus::Success).unwrap_or(&0);
    let n_failed = *counts.get(&RowStatus::Failed).unwrap_or(&0);
    let n_aborted = *counts.get(&RowStatus::Aborted).unwrap_or(&0);
    let non_terminal: i64 = counts
        .iter()
        .filter(|(status, _)| !status.is_terminal())
        .map(|(_, n)| *n)
        .sum();
    if non_terminal > 0 {
        return Ok(());
    }

    let counters = BatchCounters {
        n_success,
        n_failed,
        n_aborted,
    };
    let status = counters.implied_status();
    let batch = alya_db::get_batch(&manager.db, batch_id).await?;

    // §4.H step 3: concatenate blob rows in ascending line order, one
    // uploaded object per distinct blob name.
    let blob_rows = alya_db::list_blob_rows_ordered(&manager.db, batch_id).await?;
    let mut by_name: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for (_, blobs) in blob_rows {
        for (name, bytes) in blobs {
            by_name.entry(name).or_default().extend_from_slice(&bytes);
        }
    }

    let mut files = Vec::with_capacity(by_name.len());
    for (name, bytes) in &by_name {
        let object_key = format!("{batch_id}/{name}");
        manager
            .object_store
            .put(&object_key, bytes.clone().into(), None)
            .await?;
        files.push(BatchFile {
            batch_id,
            name: name.clone(),
            object_key,
            size_bytes: bytes.len() as i64,
            content_type: "application/octet-stream".to_string(),
        });
    }

    // §3: "optional result payload (slow-query only)" — a slow query is a
    // single-row batch, so its result is just that one row's result.
    let result = if batch.kind == RequestKind::SlowQuery {
        let rows = alya_db::list_rows(&manager.db, batch_id, 1, 0).await?;
        rows.into_iter().next().and_then(|r| r.result)
    } else {
        None
    };

    let outcome = alya_db::finalize_batch_summary(
        &manager.db,
        batch_id,
        status,
        counters,
        &files,
        result.clone(),
    )
    .await?;

    match outcome {
        alya_db::SummaryOutcome::Won => {
            info!(batch_id = %batch_id, n_success, n_failed, n_aborted, "batch summarized");
            refresh_cache_and_notify(manager, &batch, status, counters, &files, result).await;
        }
        alya_db::SummaryOutcome::LostRace => {
            warn!(batch_id = %batch_id, "lost summarization race, cleaning up uploaded objects");
            for file in &files {
                let _ = manager.object_store.delete(&file.object_key).await;
            }
        }
        alya_db::SummaryOutcome::NotReady => {
            warn!(batch_id = %batch_id, "rows appended since counting, deferring summarization");
            for file in &files {
                let _ = manager.object_store.delete(&file.object_key).await;
            }
        }
    }

    Ok(())
}

async fn refresh_cache_and_notify(
    manager: &JobManager,
    batch: &BatchRecord,
    status: alya_schemas::BatchStatus,
    counters: BatchCounters,
    files: &[BatchFile],
    result: Option<serde_json::Value>,
) {
    let batch_id = batch.batch_id;
    let output_files: BTreeMap<&str, &str> = files
        .iter()
        .map(|f| (f.name.as_str(), f.object_key.as_str()))
        .collect();
    let output_files_json = serde_json::to_value(&output_files).ok();

    let mut conn = manager.cache.clone();
    if let Err(err) = alya_cache::set_summary(
        &mut conn,
        batch_id,
        status,
        counters,
        output_files_json,
        result,
    )
    .await
    {
        warn!(batch_id = %batch_id, error = %err, "failed to refresh summary cache after summarization");
    }

    if batch.kind != RequestKind::Batch {
        return;
    }
    let Some(processor) = manager.registry.batch_processor(&batch.app, &batch.op) else {
        return;
    };

    let details = alya_registry::BatchDoneDetails {
        batch_id,
        status,
        n_success: counters.n_success,
        n_failed: counters.n_failed,
        n_aborted: counters.n_aborted,
    };
    if let Err(err) = processor.mark_done(None, &batch.batch_ctx, &details).await {
        warn!(batch_id = %batch_id, error = %err, "mark_done hook failed");
    }
}
