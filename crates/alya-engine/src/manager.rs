use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use alya_cache::ConnectionManager;
use alya_db::NewBatch;
use alya_objectstore::ObjectStoreFacade;
use alya_registry::Registry;
use alya_schemas::{
    BatchDoneView, BatchStatus, NewRow, RequestKind, SlowQueryDoneView, SlowQueryStatus,
};

use crate::error::{EngineError, EngineResult};
use crate::instance;

/// `wait_a_bit` hold window (§4.E implementation hint): rows submitted with
/// `wait_a_bit=true` are not claimable until this much time has passed,
/// giving a file-intake collaborator a brief window to append more rows
/// before workers start picking.
pub const WAIT_A_BIT_HOLD_MS: i64 = 500;

/// Public engine API (§4.E). One `JobManager` per process; it owns the
/// process-local registry (no ambient singleton, §9) plus handles to the
/// three backing stores.
pub struct JobManager {
    pub(crate) db: PgPool,
    pub(crate) cache: ConnectionManager,
    pub(crate) object_store: Arc<ObjectStoreFacade>,
    pub(crate) registry: Arc<Registry>,
    instance_id: String,
}

impl JobManager {
    pub fn new(
        db: PgPool,
        cache: ConnectionManager,
        object_store: Arc<ObjectStoreFacade>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            db,
            cache,
            object_store,
            registry,
            instance_id: instance::new_instance_id(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn wait_hold(wait_a_bit: bool) -> Option<ChronoDuration> {
        wait_a_bit.then(|| ChronoDuration::milliseconds(WAIT_A_BIT_HOLD_MS))
    }

    /// §4.E `BatchSubmit`.
    pub async fn batch_submit(
        &self,
        app: &str,
        op: &str,
        batch_ctx: Value,
        rows: Vec<NewRow>,
        wait_a_bit: bool,
    ) -> EngineResult<Uuid> {
        if rows.is_empty() && !wait_a_bit {
            return Err(EngineError::InvalidInput(
                "rows must be non-empty unless wait_a_bit is set".into(),
            ));
        }

        let batch_id = alya_db::insert_batch(
            &self.db,
            &NewBatch {
                app: app.to_string(),
                op: op.to_string(),
                kind: RequestKind::Batch,
                batch_ctx,
                visibility_hold: Self::wait_hold(wait_a_bit),
            },
        )
        .await?;

        if !rows.is_empty() {
            alya_db::insert_rows(&self.db, batch_id, &rows, Self::wait_hold(wait_a_bit)).await?;
        }

        Ok(batch_id)
    }

    /// §4.E `BatchAppend`.
    pub async fn batch_append(
        &self,
        batch_id: Uuid,
        rows: Vec<NewRow>,
        wait_a_bit: bool,
    ) -> EngineResult<i64> {
        let total = alya_db::insert_rows(&self.db, batch_id, &rows, Self::wait_hold(wait_a_bit)).await?;
        Ok(total)
    }

    /// §4.E `SlowQuerySubmit`: a single-row batch of kind `slow_query`.
    pub async fn slow_query_submit(
        &self,
        app: &str,
        op: &str,
        ctx: Value,
        input: Value,
    ) -> EngineResult<Uuid> {
        let batch_id = alya_db::insert_batch(
            &self.db,
            &NewBatch {
                app: app.to_string(),
                op: op.to_string(),
                kind: RequestKind::SlowQuery,
                batch_ctx: ctx,
                visibility_hold: None,
            },
        )
        .await?;

        alya_db::insert_rows(
            &self.db,
            batch_id,
            &[NewRow { line: 1, input }],
            None,
        )
        .await?;

        Ok(batch_id)
    }

    /// §4.E `BatchDone`. Fast path is the summary cache; a miss or a
    /// non-terminal cached status falls through to the store and refreshes
    /// the cache.
    pub async fn batch_done(&self, batch_id: Uuid) -> EngineResult<BatchDoneView> {
        let mut conn = self.cache.clone();
        if let Some(summary) = alya_cache::get_summary(&mut conn, batch_id).await? {
            if summary.status.is_terminal() {
                return Ok(BatchDoneView {
                    status: summary.status,
                    result: summary.result,
                    output_files: output_files_map(summary.output_files),
                    n_success: summary.counters.n_success,
                    n_failed: summary.counters.n_failed,
                    n_aborted: summary.counters.n_aborted,
                });
            }
        }

        let batch = alya_db::get_batch(&self.db, batch_id).await?;
        alya_cache::set_summary(
            &mut conn,
            batch_id,
            batch.status,
            batch.counters,
            batch.output_files.clone(),
            batch.result.clone(),
        )
        .await?;

        Ok(BatchDoneView {
            status: batch.status,
            result: batch.result,
            output_files: output_files_map(batch.output_files),
            n_success: batch.counters.n_success,
            n_failed: batch.counters.n_failed,
            n_aborted: batch.counters.n_aborted,
        })
    }

    /// §4.E `SlowQueryDone`: `TryLater` while the underlying single-row
    /// batch has not reached a terminal status.
    pub async fn slow_query_done(&self, req_id: Uuid) -> EngineResult<SlowQueryDoneView> {
        let view = self.batch_done(req_id).await?;
        let status = match view.status {
            BatchStatus::Success => SlowQueryStatus::Success,
            BatchStatus::Failed => SlowQueryStatus::Failed,
            BatchStatus::Aborted => SlowQueryStatus::Aborted,
            _ => SlowQueryStatus::TryLater,
        };

        let rows = alya_db::list_rows(&self.db, req_id, 1, 0).await?;
        let messages = rows.into_iter().next().map(|r| r.messages).unwrap_or_default();

        Ok(SlowQueryDoneView {
            status,
            result: view.result,
            messages,
        })
    }

    /// §4.E `BatchAbort`.
    pub async fn batch_abort(&self, batch_id: Uuid) -> EngineResult<()> {
        alya_db::abort_batch(&self.db, batch_id).await?;
        let mut conn = self.cache.clone();
        let batch = alya_db::get_batch(&self.db, batch_id).await?;
        alya_cache::set_summary(
            &mut conn,
            batch_id,
            batch.status,
            batch.counters,
            batch.output_files,
            batch.result,
        )
        .await?;
        Ok(())
    }
}

fn output_files_map(value: Option<Value>) -> std::collections::BTreeMap<String, String> {
    value
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}
