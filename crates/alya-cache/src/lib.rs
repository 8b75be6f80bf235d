//! Shared cache (§4.B): ephemeral per-batch summaries, worker heartbeats,
//! the worker registry, and per-worker row-tracking sets.
//!
//! Purely advisory except in two places invariant 5/6 rely on: heartbeat
//! presence is authoritative for worker liveness, and `get_summary` is the
//! default fast path for `BatchDone` polling.
//!
//! Cache keys follow the literal contract in §6 — callers outside this crate
//! must never read or write them directly.

use std::fmt;

use chrono::{DateTime, Utc};
pub use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use alya_schemas::{BatchCounters, BatchStatus};

pub const ENV_REDIS_URL: &str = "ALYA_REDIS_URL";

pub const SUMMARY_TTL_SECS: u64 = 100;
pub const HEARTBEAT_TTL_SECS: u64 = 60;
pub const HEARTBEAT_REFRESH_SECS: u64 = 30;

#[derive(Debug)]
pub enum CacheError {
    CacheUnavailable(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::CacheUnavailable(detail) => write!(f, "CACHE_UNAVAILABLE: {detail}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::CacheUnavailable(err.to_string())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

pub async fn connect_from_env() -> anyhow::Result<ConnectionManager> {
    let url = std::env::var(ENV_REDIS_URL)
        .map_err(|_| anyhow::anyhow!("missing env var {ENV_REDIS_URL}"))?;
    let client = redis::Client::open(url)?;
    let conn = client.get_connection_manager().await?;
    Ok(conn)
}

fn summary_key(batch_id: Uuid) -> String {
    format!("ALYA_{batch_id}_STATUS")
}

fn heartbeat_key(instance_id: &str) -> String {
    format!("ALYA_WORKER_HB_{instance_id}")
}

const WORKER_REG_KEY: &str = "ALYA_WORKER_REG";

fn worker_rows_key(instance_id: &str) -> String {
    format!("ALYA_WORKER_ROWS_{instance_id}")
}

/// A row key as stored in a worker's row-tracking set: `"{batch_id}:{line}"`.
pub fn row_key(batch_id: Uuid, line: i64) -> String {
    format!("{batch_id}:{line}")
}

pub fn parse_row_key(s: &str) -> Option<(Uuid, i64)> {
    let (batch_id, line) = s.split_once(':')?;
    Some((batch_id.parse().ok()?, line.parse().ok()?))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub status: BatchStatus,
    pub counters: BatchCounters,
    /// Populated once the batch reaches a terminal status, so a cache hit on
    /// a terminal summary never needs a store round-trip for `BatchDone`.
    pub output_files: Option<serde_json::Value>,
    /// Slow-query result payload (§3: "optional result payload (slow-query
    /// only)"). `None` for batch-kind requests.
    pub result: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

pub async fn set_summary(
    conn: &mut ConnectionManager,
    batch_id: Uuid,
    status: BatchStatus,
    counters: BatchCounters,
    output_files: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
) -> CacheResult<()> {
    let summary = Summary {
        status,
        counters,
        output_files,
        result,
        updated_at: Utc::now(),
    };
    let payload = serde_json::to_string(&summary)
        .map_err(|e| CacheError::CacheUnavailable(format!("serialize summary: {e}")))?;
    conn.set_ex::<_, _, ()>(summary_key(batch_id), payload, SUMMARY_TTL_SECS)
        .await?;
    Ok(())
}

pub async fn get_summary(conn: &mut ConnectionManager, batch_id: Uuid) -> CacheResult<Option<Summary>> {
    let raw: Option<String> = conn.get(summary_key(batch_id)).await?;
    match raw {
        None => Ok(None),
        Some(raw) => {
            let summary = serde_json::from_str(&raw)
                .map_err(|e| CacheError::CacheUnavailable(format!("deserialize summary: {e}")))?;
            Ok(Some(summary))
        }
    }
}

/// Set/refresh a worker's heartbeat key (TTL 60 s, refreshed every 30 s by
/// the worker itself — see `alya-engine`'s heartbeat refresher).
pub async fn heartbeat(conn: &mut ConnectionManager, instance_id: &str) -> CacheResult<()> {
    conn.set_ex::<_, _, ()>(heartbeat_key(instance_id), "1", HEARTBEAT_TTL_SECS)
        .await?;
    Ok(())
}

/// Absence of the heartbeat key, while the id is still in the registry,
/// means the worker is dead (§3 worker heartbeat key invariant).
pub async fn is_alive(conn: &mut ConnectionManager, instance_id: &str) -> CacheResult<bool> {
    let exists: bool = conn.exists(heartbeat_key(instance_id)).await?;
    Ok(exists)
}

pub async fn remove_heartbeat(conn: &mut ConnectionManager, instance_id: &str) -> CacheResult<()> {
    conn.del::<_, ()>(heartbeat_key(instance_id)).await?;
    Ok(())
}

pub async fn add_worker(conn: &mut ConnectionManager, instance_id: &str) -> CacheResult<()> {
    conn.sadd::<_, _, ()>(WORKER_REG_KEY, instance_id).await?;
    Ok(())
}

pub async fn remove_worker(conn: &mut ConnectionManager, instance_id: &str) -> CacheResult<()> {
    conn.srem::<_, _, ()>(WORKER_REG_KEY, instance_id).await?;
    Ok(())
}

pub async fn list_workers(conn: &mut ConnectionManager) -> CacheResult<Vec<String>> {
    let ids: Vec<String> = conn.smembers(WORKER_REG_KEY).await?;
    Ok(ids)
}

pub async fn track_row(conn: &mut ConnectionManager, instance_id: &str, batch_id: Uuid, line: i64) -> CacheResult<()> {
    conn.sadd::<_, _, ()>(worker_rows_key(instance_id), row_key(batch_id, line))
        .await?;
    Ok(())
}

pub async fn untrack_row(conn: &mut ConnectionManager, instance_id: &str, batch_id: Uuid, line: i64) -> CacheResult<()> {
    conn.srem::<_, _, ()>(worker_rows_key(instance_id), row_key(batch_id, line))
        .await?;
    Ok(())
}

pub async fn list_rows(conn: &mut ConnectionManager, instance_id: &str) -> CacheResult<Vec<(Uuid, i64)>> {
    let keys: Vec<String> = conn.smembers(worker_rows_key(instance_id)).await?;
    Ok(keys.iter().filter_map(|k| parse_row_key(k)).collect())
}

pub async fn clear_rows(conn: &mut ConnectionManager, instance_id: &str) -> CacheResult<()> {
    conn.del::<_, ()>(worker_rows_key(instance_id)).await?;
    Ok(())
}

/// Atomic float increment used by processors for their own accounting
/// (not consulted by the engine itself).
pub async fn incr_float(conn: &mut ConnectionManager, key: &str, amount: f64) -> CacheResult<f64> {
    let total: f64 = conn.incr(key, amount).await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_key_round_trips() {
        let batch_id = Uuid::new_v4();
        let key = row_key(batch_id, 42);
        assert_eq!(parse_row_key(&key), Some((batch_id, 42)));
    }

    #[test]
    fn parse_row_key_rejects_malformed_input() {
        assert!(parse_row_key("not-a-row-key").is_none());
        assert!(parse_row_key("not-a-uuid:1").is_none());
    }
}
