//! End-to-end: submit a slow query, drive it through a real worker loop with
//! the echo slow-query processor, and observe a terminal `SlowQueryDone` with
//! the processor's result payload round-tripped.
//!
//! Requires both `ALYA_DATABASE_URL` and `ALYA_REDIS_URL`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use alya_registry::Registry;
use alya_schemas::SlowQueryStatus;

fn require_env() -> Option<String> {
    if std::env::var(alya_db::ENV_DB_URL).is_err() || std::env::var(alya_cache::ENV_REDIS_URL).is_err() {
        return None;
    }
    Some("ok".to_string())
}

#[tokio::test]
#[ignore = "requires ALYA_DATABASE_URL and ALYA_REDIS_URL; run with --include-ignored against a live Postgres + Redis"]
async fn successful_slow_query_reports_its_result() -> anyhow::Result<()> {
    if require_env().is_none() {
        panic!("requires ALYA_DATABASE_URL and ALYA_REDIS_URL; run: cargo test -p alya-testkit -- --include-ignored");
    }

    let registry = Arc::new(Registry::new());
    registry.register_slow_query_processor("accounts", "balance", Arc::new(alya_testkit::EchoSlowQueryProcessor))?;

    let manager = Arc::new(alya_testkit::make_manager_with_registry(registry).await?);

    let req_id = manager
        .slow_query_submit("accounts", "balance", json!({}), json!({"account": "abc123"}))
        .await?;

    let view = alya_testkit::drain_slow_query_with_worker(manager, req_id, Duration::from_secs(30)).await?;

    assert_eq!(view.status, SlowQueryStatus::Success);
    assert_eq!(view.result, Some(json!({"account": "abc123"})));
    assert!(view.messages.is_empty());

    Ok(())
}

#[tokio::test]
#[ignore = "requires ALYA_DATABASE_URL and ALYA_REDIS_URL; run with --include-ignored against a live Postgres + Redis"]
async fn failed_slow_query_reports_failed_with_no_try_later() -> anyhow::Result<()> {
    if require_env().is_none() {
        panic!("requires ALYA_DATABASE_URL and ALYA_REDIS_URL; run: cargo test -p alya-testkit -- --include-ignored");
    }

    let registry = Arc::new(Registry::new());
    registry.register_slow_query_processor("accounts", "balance", Arc::new(alya_testkit::EchoSlowQueryProcessor))?;

    let manager = Arc::new(alya_testkit::make_manager_with_registry(registry).await?);

    let req_id = manager
        .slow_query_submit("accounts", "balance", json!({}), json!({"fail": true}))
        .await?;

    let view = alya_testkit::drain_slow_query_with_worker(manager, req_id, Duration::from_secs(30)).await?;

    assert_eq!(view.status, SlowQueryStatus::Failed);
    assert_eq!(view.result, Some(json!({"fail": true})));

    Ok(())
}
