use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use rand::Rng;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use alya_registry::{BatchJobOutcome, InitBlockCache};
use alya_schemas::{ProcessorMessage, RowStatus};

use crate::manager::JobManager;
use crate::summarizer;

const CLAIM_BACKOFF_MIN_MS: u64 = 100;
const CLAIM_BACKOFF_MAX_MS: u64 = 500;

/// §4.F: one worker instance's claim -> dispatch -> execute -> finalize ->
/// untrack -> maybe-summarize cycle, plus its heartbeat refresher and
/// recovery sweeper.
pub struct Worker {
    manager: Arc<JobManager>,
    init_blocks: InitBlockCache,
}

impl Worker {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self {
            manager,
            init_blocks: InitBlockCache::new(),
        }
    }

    /// §4.E `Run`/`RunWithContext`. Stopping is by cancelling `token`.
    pub async fn run(self, token: CancellationToken) -> anyhow::Result<()> {
        let instance_id = self.manager.instance_id().to_string();
        let mut cache = self.manager.cache.clone();

        alya_cache::add_worker(&mut cache, &instance_id).await?;
        alya_cache::heartbeat(&mut cache, &instance_id).await?;
        info!(instance_id = %instance_id, "worker started");

        let heartbeat_task = tokio::spawn(heartbeat_refresher(cache.clone(), instance_id.clone(), token.clone()));
        let sweeper_task = tokio::spawn(crate::sweeper::run(self.manager.clone(), token.clone()));

        self.loop_until_cancelled(token.clone()).await;

        self.init_blocks.close_all();
        let _ = alya_cache::remove_heartbeat(&mut cache, &instance_id).await;
        let _ = alya_cache::remove_worker(&mut cache, &instance_id).await;
        let _ = alya_cache::clear_rows(&mut cache, &instance_id).await;

        heartbeat_task.abort();
        sweeper_task.abort();
        info!(instance_id = %instance_id, "worker shut down");
        Ok(())
    }

    async fn loop_until_cancelled(&self, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                return;
            }

            match alya_db::claim_next_row(&self.manager.db, self.manager.instance_id()).await {
                Ok(Some(claimed)) => {
                    self.handle_claimed_row(claimed).await;
                }
                Ok(None) => {
                    let jitter_ms =
                        rand::thread_rng().gen_range(CLAIM_BACKOFF_MIN_MS..=CLAIM_BACKOFF_MAX_MS);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(jitter_ms)) => {}
                        _ = token.cancelled() => return,
                    }
                }
                Err(err) => {
                    warn!(error = %err, "claim_next_row failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(CLAIM_BACKOFF_MAX_MS)) => {}
                        _ = token.cancelled() => return,
                    }
                }
            }
        }
    }

    async fn handle_claimed_row(&self, claimed: alya_schemas::ClaimedRow) {
        match claimed.kind {
            alya_schemas::RequestKind::Batch => self.handle_batch_row(claimed).await,
            alya_schemas::RequestKind::SlowQuery => self.handle_slow_query_row(claimed).await,
        }
    }

    async fn handle_batch_row(&self, claimed: alya_schemas::ClaimedRow) {
        let batch_id = claimed.batch_id;
        let line = claimed.line;
        let mut cache = self.manager.cache.clone();

        let Some(processor) = self.manager.registry.batch_processor(&claimed.app, &claimed.op) else {
            self.finalize_failed(
                batch_id,
                line,
                "no processor registered",
                ProcessorMessage {
                    msg_id: 0,
                    err_code: "NO_PROCESSOR".to_string(),
                    field: None,
                    vals: None,
                },
            )
            .await;
            self.maybe_summarize(batch_id).await;
            return;
        };

        let init_block = match self
            .init_blocks
            .get_or_init(&self.manager.registry, &claimed.app)
            .await
        {
            Ok(block) => block,
            Err(err) => {
                self.finalize_failed(
                    batch_id,
                    line,
                    &err,
                    ProcessorMessage {
                        msg_id: 0,
                        err_code: "INIT_FAILED".to_string(),
                        field: None,
                        vals: None,
                    },
                )
                .await;
                self.maybe_summarize(batch_id).await;
                return;
            }
        };

        let _ = alya_cache::track_row(&mut cache, self.manager.instance_id(), batch_id, line).await;

        let outcome = self
            .execute_with_panic_recovery(
                processor.as_ref(),
                init_block.as_deref().map(|b| b.as_ref()),
                &claimed.batch_ctx,
                line,
                &claimed.input,
            )
            .await;

        let status = match outcome.status {
            RowStatus::Success | RowStatus::Failed => outcome.status,
            _ => RowStatus::Failed,
        };

        if let Err(err) = alya_db::finalize_row(
            &self.manager.db,
            batch_id,
            line,
            status,
            outcome.result,
            &outcome.messages,
            &outcome.blob_rows,
        )
        .await
        {
            error!(batch_id = %batch_id, line, error = %err, "finalize_row failed");
        }

        let _ = alya_cache::untrack_row(&mut cache, self.manager.instance_id(), batch_id, line).await;

        self.maybe_summarize(batch_id).await;
    }

    /// §4.D/§4.F slow-query dispatch. A slow query is a single-row batch
    /// (§3), so once dispatched its row is finalized and summarized through
    /// the exact same pipeline a regular batch row goes through — only the
    /// processor lookup and invocation differ.
    async fn handle_slow_query_row(&self, claimed: alya_schemas::ClaimedRow) {
        let batch_id = claimed.batch_id;
        let line = claimed.line;
        let mut cache = self.manager.cache.clone();

        let Some(processor) = self
            .manager
            .registry
            .slow_query_processor(&claimed.app, &claimed.op)
        else {
            self.finalize_failed(
                batch_id,
                line,
                "no processor registered",
                ProcessorMessage {
                    msg_id: 0,
                    err_code: "NO_PROCESSOR".to_string(),
                    field: None,
                    vals: None,
                },
            )
            .await;
            self.maybe_summarize(batch_id).await;
            return;
        };

        let init_block = match self
            .init_blocks
            .get_or_init(&self.manager.registry, &claimed.app)
            .await
        {
            Ok(block) => block,
            Err(err) => {
                self.finalize_failed(
                    batch_id,
                    line,
                    &err,
                    ProcessorMessage {
                        msg_id: 0,
                        err_code: "INIT_FAILED".to_string(),
                        field: None,
                        vals: None,
                    },
                )
                .await;
                self.maybe_summarize(batch_id).await;
                return;
            }
        };

        let _ = alya_cache::track_row(&mut cache, self.manager.instance_id(), batch_id, line).await;

        let outcome = self
            .execute_slow_query_with_panic_recovery(
                processor.as_ref(),
                init_block.as_deref().map(|b| b.as_ref()),
                &claimed.batch_ctx,
                &claimed.input,
            )
            .await;

        let status = match outcome.status {
            alya_schemas::SlowQueryStatus::Success => RowStatus::Success,
            alya_schemas::SlowQueryStatus::Failed => RowStatus::Failed,
            alya_schemas::SlowQueryStatus::Aborted => RowStatus::Aborted,
            alya_schemas::SlowQueryStatus::TryLater => RowStatus::Failed,
        };

        if let Err(err) = alya_db::finalize_row(
            &self.manager.db,
            batch_id,
            line,
            status,
            outcome.result,
            &outcome.messages,
            &outcome.blob_rows,
        )
        .await
        {
            error!(batch_id = %batch_id, line, error = %err, "finalize_row failed");
        }

        let _ = alya_cache::untrack_row(&mut cache, self.manager.instance_id(), batch_id, line).await;

        self.maybe_summarize(batch_id).await;
    }

    async fn execute_with_panic_recovery(
        &self,
        processor: &dyn alya_registry::BatchProcessor,
        init_block: Option<&dyn alya_registry::InitBlock>,
        batch_ctx: &Value,
        line: i64,
        input: &Value,
    ) -> BatchJobOutcome {
        let fut = processor.do_batch_job(init_block, batch_ctx, line, input);
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => BatchJobOutcome {
                status: RowStatus::Failed,
                result: json!(null),
                messages: vec![ProcessorMessage {
                    msg_id: 0,
                    err_code: "ProcessorPanic".to_string(),
                    field: None,
                    vals: None,
                }],
                blob_rows: Default::default(),
            },
        }
    }

    async fn execute_slow_query_with_panic_recovery(
        &self,
        processor: &dyn alya_registry::SlowQueryProcessor,
        init_block: Option<&dyn alya_registry::InitBlock>,
        ctx: &Value,
        input: &Value,
    ) -> alya_registry::SlowQueryOutcome {
        let fut = processor.do_slow_query(init_block, ctx, input);
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => alya_registry::SlowQueryOutcome {
                status: alya_schemas::SlowQueryStatus::Failed,
                result: json!(null),
                messages: vec![ProcessorMessage {
                    msg_id: 0,
                    err_code: "ProcessorPanic".to_string(),
                    field: None,
                    vals: None,
                }],
                blob_rows: Default::default(),
            },
        }
    }

    async fn finalize_failed(&self, batch_id: uuid::Uuid, line: i64, detail: &str, message: ProcessorMessage) {
        warn!(batch_id = %batch_id, line, detail, "row failed before dispatch");
        if let Err(err) = alya_db::finalize_row(
            &self.manager.db,
            batch_id,
            line,
            RowStatus::Failed,
            json!({"error": detail}),
            &[message],
            &Default::default(),
        )
        .await
        {
            error!(batch_id = %batch_id, line, error = %err, "finalize_row (pre-dispatch failure) failed");
        }
    }

    async fn maybe_summarize(&self, batch_id: uuid::Uuid) {
        match alya_db::count_rows_by_status(&self.manager.db, batch_id).await {
            Ok(counts) => {
                let non_terminal: i64 = counts
                    .iter()
                    .filter(|(status, _)| !status.is_terminal())
                    .map(|(_, n)| *n)
                    .sum();
                if non_terminal == 0 {
                    summarizer::summarize(&self.manager, batch_id).await;
                }
            }
            Err(err) => error!(batch_id = %batch_id, error = %err, "count_rows_by_status failed"),
        }
    }
}

async fn heartbeat_refresher(
    mut cache: alya_cache::ConnectionManager,
    instance_id: String,
    token: CancellationToken,
) {
    let interval = Duration::from_secs(alya_cache::HEARTBEAT_REFRESH_SECS);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(err) = alya_cache::heartbeat(&mut cache, &instance_id).await {
                    warn!(instance_id = %instance_id, error = %err, "heartbeat refresh failed");
                }
            }
            _ = token.cancelled() => return,
        }
    }
}
