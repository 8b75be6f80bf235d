//! End-to-end: submit a batch, drive it through a real worker loop with the
//! echo processor, and observe a terminal, correctly-counted `BatchDone`.
//!
//! Requires both `ALYA_DATABASE_URL` and `ALYA_REDIS_URL`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use alya_registry::Registry;
use alya_schemas::{BatchStatus, NewRow};

fn require_env() -> Option<String> {
    if std::env::var(alya_db::ENV_DB_URL).is_err() || std::env::var(alya_cache::ENV_REDIS_URL).is_err() {
        return None;
    }
    Some("ok".to_string())
}

#[tokio::test]
#[ignore = "requires ALYA_DATABASE_URL and ALYA_REDIS_URL; run with --include-ignored against a live Postgres + Redis"]
async fn mixed_success_and_failure_rows_summarize_correctly() -> anyhow::Result<()> {
    if require_env().is_none() {
        panic!("requires ALYA_DATABASE_URL and ALYA_REDIS_URL; run: cargo test -p alya-testkit -- --include-ignored");
    }

    let registry = Arc::new(Registry::new());
    registry.register_batch_processor("orders", "export", Arc::new(alya_testkit::EchoProcessor))?;

    let manager = Arc::new(alya_testkit::make_manager_with_registry(registry).await?);

    let rows = vec![
        NewRow { line: 1, input: json!({"n": 1}) },
        NewRow { line: 2, input: json!({"n": 2}) },
        NewRow { line: 3, input: json!({"fail": true}) },
    ];
    let batch_id = manager.batch_submit("orders", "export", json!({}), rows, false).await?;

    let view = alya_testkit::drain_batch_with_worker(manager, batch_id, Duration::from_secs(30)).await?;

    assert_eq!(view.status, BatchStatus::Failed, "any failed row must fail the batch");
    assert_eq!(view.n_success, 2);
    assert_eq!(view.n_failed, 1);
    assert_eq!(view.n_aborted, 0);

    Ok(())
}

#[tokio::test]
#[ignore = "requires ALYA_DATABASE_URL and ALYA_REDIS_URL; run with --include-ignored against a live Postgres + Redis"]
async fn all_success_rows_with_blobs_produce_a_summarized_file() -> anyhow::Result<()> {
    if require_env().is_none() {
        panic!("requires ALYA_DATABASE_URL and ALYA_REDIS_URL; run: cargo test -p alya-testkit -- --include-ignored");
    }

    let registry = Arc::new(Registry::new());
    registry.register_batch_processor("reports", "csv", Arc::new(alya_testkit::EchoProcessor))?;

    let manager = Arc::new(alya_testkit::make_manager_with_registry(registry).await?);

    let rows = vec![
        NewRow { line: 1, input: json!({"blob": {"name": "out.csv", "text": "a,b\n"}}) },
        NewRow { line: 2, input: json!({"blob": {"name": "out.csv", "text": "1,2\n"}}) },
    ];
    let batch_id = manager.batch_submit("reports", "csv", json!({}), rows, false).await?;

    let view = alya_testkit::drain_batch_with_worker(manager, batch_id, Duration::from_secs(30)).await?;

    assert_eq!(view.status, BatchStatus::Success);
    assert_eq!(view.n_success, 2);
    assert!(
        view.output_files.contains_key("out.csv"),
        "blob rows for the same name must concatenate into one output file"
    );

    Ok(())
}
