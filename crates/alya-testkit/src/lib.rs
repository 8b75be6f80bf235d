//! Shared helpers for the `tests/scenario_*.rs` suites across the engine
//! crates: ephemeral Postgres/Redis connections migrated fresh per test run,
//! an in-memory object store, and a minimal echo `BatchProcessor` so
//! end-to-end scenarios don't need a real domain processor.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use alya_engine::JobManager;
use alya_registry::{
    BatchJobOutcome, BatchProcessor, InitBlock, Registry, SlowQueryOutcome, SlowQueryProcessor,
};
use alya_schemas::{BatchDoneView, BatchStatus, RowStatus, SlowQueryDoneView, SlowQueryStatus};

/// Connect to Postgres via `ALYA_DATABASE_URL` and ensure migrations are
/// applied. Callers are responsible for giving each test its own `app`/`op`
/// pair (or batch ids) so concurrent test runs don't interfere — there is no
/// per-test schema isolation, matching integration tests against a real
/// shared database rather than mocking it.
pub async fn make_pool() -> anyhow::Result<PgPool> {
    alya_db::testkit_db_pool().await
}

pub async fn make_cache() -> anyhow::Result<alya_cache::ConnectionManager> {
    alya_cache::connect_from_env().await
}

/// An in-memory object store, isolated per call — safe for concurrent tests.
pub fn make_object_store() -> Arc<alya_objectstore::ObjectStoreFacade> {
    let store = object_store::memory::InMemory::new();
    Arc::new(alya_objectstore::ObjectStoreFacade::new(
        "test-bucket",
        Arc::new(store),
    ))
}

pub async fn make_manager() -> anyhow::Result<JobManager> {
    make_manager_with_registry(Arc::new(Registry::new())).await
}

pub async fn make_manager_with_registry(registry: Arc<Registry>) -> anyhow::Result<JobManager> {
    let db = make_pool().await?;
    let cache = make_cache().await?;
    let object_store = make_object_store();
    Ok(JobManager::new(db, cache, object_store, registry))
}

/// Echoes `input` back as `result` on `Success`, unless `input.fail` is
/// `true` (then it reports `Failed`), or `input.blob` is `{"name": ..,
/// "text": ..}` (then it writes that text under the given blob name so
/// summarization has something to concatenate).
pub struct EchoProcessor;

#[async_trait]
impl BatchProcessor for EchoProcessor {
    async fn do_batch_job(
        &self,
        _init_block: Option<&dyn InitBlock>,
        _batch_ctx: &Value,
        _line: i64,
        input: &Value,
    ) -> BatchJobOutcome {
        if input.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            return BatchJobOutcome {
                status: RowStatus::Failed,
                result: input.clone(),
                messages: vec![],
                blob_rows: Default::default(),
            };
        }

        let mut blob_rows = std::collections::BTreeMap::new();
        if let Some(blob) = input.get("blob") {
            let name = blob.get("name").and_then(Value::as_str).unwrap_or("out").to_string();
            let text = blob.get("text").and_then(Value::as_str).unwrap_or("").to_string();
            blob_rows.insert(name, text.into_bytes());
        }

        BatchJobOutcome {
            status: RowStatus::Success,
            result: input.clone(),
            messages: vec![],
            blob_rows,
        }
    }
}

/// Echoes `input` back as `result` on `Success`, unless `input.fail` is
/// `true` (then it reports `Failed`), or `input.abort` is `true` (then it
/// reports `Aborted`) — mirrors `EchoProcessor`'s behavior for the
/// single-row slow-query dispatch path.
pub struct EchoSlowQueryProcessor;

#[async_trait]
impl SlowQueryProcessor for EchoSlowQueryProcessor {
    async fn do_slow_query(
        &self,
        _init_block: Option<&dyn InitBlock>,
        _ctx: &Value,
        input: &Value,
    ) -> SlowQueryOutcome {
        if input.get("abort").and_then(Value::as_bool).unwrap_or(false) {
            return SlowQueryOutcome {
                status: SlowQueryStatus::Aborted,
                result: input.clone(),
                messages: vec![],
                blob_rows: Default::default(),
            };
        }
        if input.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            return SlowQueryOutcome {
                status: SlowQueryStatus::Failed,
                result: input.clone(),
                messages: vec![],
                blob_rows: Default::default(),
            };
        }

        SlowQueryOutcome {
            status: SlowQueryStatus::Success,
            result: input.clone(),
            messages: vec![],
            blob_rows: Default::default(),
        }
    }
}

/// Polls `JobManager::batch_done` until it reaches a terminal status or
/// `timeout` elapses, driving rows through in-process with a single
/// `alya_engine::Worker` task rather than a separately spawned binary.
pub async fn drain_batch_with_worker(
    manager: Arc<JobManager>,
    batch_id: Uuid,
    timeout: std::time::Duration,
) -> anyhow::Result<BatchDoneView> {
    let worker = alya_engine::Worker::new(manager.clone());
    let token = alya_engine::CancellationToken::new();
    let run_token = token.clone();
    let worker_handle = tokio::spawn(async move { worker.run(run_token).await });

    let result = wait_for_batch_done(&manager, batch_id, timeout).await;

    token.cancel();
    let _ = worker_handle.await;
    result
}

pub async fn wait_for_batch_done(
    manager: &JobManager,
    batch_id: Uuid,
    timeout: std::time::Duration,
) -> anyhow::Result<BatchDoneView> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let view = manager.batch_done(batch_id).await?;
        if view.status != BatchStatus::Queued && view.status != BatchStatus::InProgress {
            return Ok(view);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("batch {batch_id} did not reach a terminal status within {timeout:?}");
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

/// Slow-query counterpart of `drain_batch_with_worker`: polls
/// `JobManager::slow_query_done` until it leaves `TryLater` or `timeout`
/// elapses, driving the single row through with a real `Worker`.
pub async fn drain_slow_query_with_worker(
    manager: Arc<JobManager>,
    req_id: Uuid,
    timeout: std::time::Duration,
) -> anyhow::Result<SlowQueryDoneView> {
    let worker = alya_engine::Worker::new(manager.clone());
    let token = alya_engine::CancellationToken::new();
    let run_token = token.clone();
    let worker_handle = tokio::spawn(async move { worker.run(run_token).await });

    let result = wait_for_slow_query_done(&manager, req_id, timeout).await;

    token.cancel();
    let _ = worker_handle.await;
    result
}

pub async fn wait_for_slow_query_done(
    manager: &JobManager,
    req_id: Uuid,
    timeout: std::time::Duration,
) -> anyhow::Result<SlowQueryDoneView> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let view = manager.slow_query_done(req_id).await?;
        if view.status != SlowQueryStatus::TryLater {
            return Ok(view);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("slow query {req_id} did not reach a terminal status within {timeout:?}");
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
