use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::manager::JobManager;
use crate::summarizer;

/// §4.I recovery sweeper interval: dead-worker and missed-summary rescue run
/// on the same cadence as the worker heartbeat TTL, so a dead worker's rows
/// are never left orphaned for longer than one TTL window.
const SWEEP_INTERVAL_SECS: u64 = 60;

/// Runs until `token` is cancelled. One sweeper per `JobManager` is enough —
/// running it from every worker would just mean every instance does
/// redundant, harmless work (all of it is idempotent).
pub async fn run(manager: std::sync::Arc<JobManager>, token: CancellationToken) {
    let interval = Duration::from_secs(SWEEP_INTERVAL_SECS);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                rescue_dead_workers(&manager).await;
                rescue_missed_summaries(&manager).await;
            }
            _ = token.cancelled() => return,
        }
    }
}

/// §4.I dead-worker rescue: a registered worker whose heartbeat key has
/// expired is presumed dead. Every row still tracked in its row set is
/// reset from `in_progress` back to `queued` so another worker can claim
/// it, then the dead worker's registry/row-set entries are cleared.
async fn rescue_dead_workers(manager: &JobManager) {
    let mut conn = manager.cache.clone();
    let workers = match alya_cache::list_workers(&mut conn).await {
        Ok(w) => w,
        Err(err) => {
            error!(error = %err, "sweeper: list_workers failed");
            return;
        }
    };

    for instance_id in workers {
        if instance_id == manager.instance_id() {
            continue;
        }
        let alive = match alya_cache::is_alive(&mut conn, &instance_id).await {
            Ok(alive) => alive,
            Err(err) => {
                error!(instance_id = %instance_id, error = %err, "sweeper: is_alive failed");
                continue;
            }
        };
        if alive {
            continue;
        }

        let rows = match alya_cache::list_rows(&mut conn, &instance_id).await {
            Ok(rows) => rows,
            Err(err) => {
                error!(instance_id = %instance_id, error = %err, "sweeper: list_rows failed");
                continue;
            }
        };

        if !rows.is_empty() {
            match alya_db::reset_rows(&manager.db, &instance_id, &rows).await {
                Ok(n) => info!(instance_id = %instance_id, rows_reset = n, "sweeper: reset dead worker's rows"),
                Err(err) => {
                    error!(instance_id = %instance_id, error = %err, "sweeper: reset_rows failed");
                    continue;
                }
            }
        }

        if let Err(err) = alya_cache::clear_rows(&mut conn, &instance_id).await {
            warn!(instance_id = %instance_id, error = %err, "sweeper: clear_rows failed");
        }
        if let Err(err) = alya_cache::remove_worker(&mut conn, &instance_id).await {
            warn!(instance_id = %instance_id, error = %err, "sweeper: remove_worker failed");
        }
    }
}

/// §4.I missed-summary rescue: a batch whose rows are all terminal but was
/// never summarized (the worker that finalized its last row crashed before
/// calling the summarizer) gets one retry per sweep.
async fn rescue_missed_summaries(manager: &JobManager) {
    let missed = match alya_db::list_batches_missed_summary(&manager.db).await {
        Ok(ids) => ids,
        Err(err) => {
            error!(error = %err, "sweeper: list_batches_missed_summary failed");
            return;
        }
    };

    for batch_id in missed {
        info!(batch_id = %batch_id, "sweeper: retrying missed summarization");
        summarizer::summarize(manager, batch_id).await;
    }
}
