//! Shared request/batch/row data model.
//!
//! Plain data types only — no I/O, no business logic. `alya-db` persists
//! these, `alya-cache` caches a projection of them, `alya-engine` drives
//! their lifecycle transitions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Top-level kind of a submitted request. A slow query is modeled as a
/// batch of exactly one row (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Batch,
    SlowQuery,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Batch => write!(f, "batch"),
            RequestKind::SlowQuery => write!(f, "slow_query"),
        }
    }
}

impl std::str::FromStr for RequestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batch" => Ok(RequestKind::Batch),
            "slow_query" => Ok(RequestKind::SlowQuery),
            other => Err(format!("unknown request kind: {other}")),
        }
    }
}

/// Batch/request-level status (§3). `Wait` only appears on slow-query
/// requests before their single row has even begun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    InProgress,
    Success,
    Failed,
    Aborted,
    Wait,
}

impl BatchStatus {
    /// Invariant 4: a batch is terminal only in success/failed/aborted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Success | BatchStatus::Failed | BatchStatus::Aborted
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Queued => "queued",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Success => "success",
            BatchStatus::Failed => "failed",
            BatchStatus::Aborted => "aborted",
            BatchStatus::Wait => "wait",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(BatchStatus::Queued),
            "in_progress" => Ok(BatchStatus::InProgress),
            "success" => Ok(BatchStatus::Success),
            "failed" => Ok(BatchStatus::Failed),
            "aborted" => Ok(BatchStatus::Aborted),
            "wait" => Ok(BatchStatus::Wait),
            other => Err(format!("unknown batch status: {other}")),
        }
    }
}

/// Row-level status (§3). Terminal states never transition again
/// (invariant 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Queued,
    InProgress,
    Success,
    Failed,
    Aborted,
}

impl RowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RowStatus::Success | RowStatus::Failed | RowStatus::Aborted
        )
    }
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RowStatus::Queued => "queued",
            RowStatus::InProgress => "in_progress",
            RowStatus::Success => "success",
            RowStatus::Failed => "failed",
            RowStatus::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RowStatus::Queued),
            "in_progress" => Ok(RowStatus::InProgress),
            "success" => Ok(RowStatus::Success),
            "failed" => Ok(RowStatus::Failed),
            "aborted" => Ok(RowStatus::Aborted),
            other => Err(format!("unknown row status: {other}")),
        }
    }
}

/// Diagnostic object a processor attaches to a row outcome (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorMessage {
    pub msg_id: i64,
    pub err_code: String,
    pub field: Option<String>,
    pub vals: Option<Vec<String>>,
}

/// Terminal counters for a batch. Invariant 3: these always sum to the
/// number of rows in the corresponding terminal states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounters {
    pub n_success: i64,
    pub n_failed: i64,
    pub n_aborted: i64,
}

impl BatchCounters {
    pub fn total(&self) -> i64 {
        self.n_success + self.n_failed + self.n_aborted
    }

    /// Batch status implied by terminal counters (§4.H step 4).
    pub fn implied_status(&self) -> BatchStatus {
        if self.n_aborted > 0 {
            BatchStatus::Aborted
        } else if self.n_failed > 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::Success
        }
    }
}

/// A request/batch record (§3). One row per submission in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: Uuid,
    pub app: String,
    pub op: String,
    pub kind: RequestKind,
    pub status: BatchStatus,
    pub batch_ctx: Value,
    pub counters: BatchCounters,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_files: Option<Value>,
    pub result: Option<Value>,
    pub row_count: Option<i64>,
}

/// One input line of a batch (§3). Composite key is `(batch_id, line)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRow {
    pub batch_id: Uuid,
    pub line: i64,
    pub status: RowStatus,
    pub input: Value,
    pub result: Option<Value>,
    pub messages: Vec<ProcessorMessage>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A claimed row, as returned by the §4.G row claimer — carries just
/// enough context for the worker to dispatch it without a second
/// round-trip to the store.
#[derive(Debug, Clone)]
pub struct ClaimedRow {
    pub batch_id: Uuid,
    pub line: i64,
    pub app: String,
    pub op: String,
    pub kind: RequestKind,
    pub batch_ctx: Value,
    pub input: Value,
}

/// One artifact a completed batch emitted (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFile {
    pub batch_id: Uuid,
    pub name: String,
    pub object_key: String,
    pub size_bytes: i64,
    pub content_type: String,
}

/// A new row to insert, as supplied by `BatchSubmit`/`BatchAppend`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRow {
    pub line: i64,
    pub input: Value,
}

/// Outcome a `BatchProcessor` hands back for one row (§6).
#[derive(Debug, Clone)]
pub struct RowOutcome {
    pub status: RowStatus,
    pub result: Value,
    pub messages: Vec<ProcessorMessage>,
    pub blob_rows: std::collections::BTreeMap<String, Vec<u8>>,
}

/// View returned by `BatchDone` (§4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDoneView {
    pub status: BatchStatus,
    pub output_files: std::collections::BTreeMap<String, String>,
    pub result: Option<Value>,
    pub n_success: i64,
    pub n_failed: i64,
    pub n_aborted: i64,
}

/// View returned by `SlowQueryDone` (§4.E, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowQueryDoneView {
    pub status: SlowQueryStatus,
    pub result: Option<Value>,
    pub messages: Vec<ProcessorMessage>,
}

/// Slow-query polling status distinguishes "keep polling" from a terminal
/// verdict (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlowQueryStatus {
    TryLater,
    Success,
    Failed,
    Aborted,
}

impl fmt::Display for SlowQueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlowQueryStatus::TryLater => "try_later",
            SlowQueryStatus::Success => "success",
            SlowQueryStatus::Failed => "failed",
            SlowQueryStatus::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implied_status_prefers_aborted_over_failed() {
        let c = BatchCounters {
            n_success: 3,
            n_failed: 2,
            n_aborted: 1,
        };
        assert_eq!(c.implied_status(), BatchStatus::Aborted);
    }

    #[test]
    fn implied_status_prefers_failed_over_success() {
        let c = BatchCounters {
            n_success: 3,
            n_failed: 1,
            n_aborted: 0,
        };
        assert_eq!(c.implied_status(), BatchStatus::Failed);
    }

    #[test]
    fn implied_status_success_when_all_succeeded() {
        let c = BatchCounters {
            n_success: 3,
            n_failed: 0,
            n_aborted: 0,
        };
        assert_eq!(c.implied_status(), BatchStatus::Success);
    }

    #[test]
    fn status_round_trips_through_display_and_from_str() {
        for s in [
            BatchStatus::Queued,
            BatchStatus::InProgress,
            BatchStatus::Success,
            BatchStatus::Failed,
            BatchStatus::Aborted,
            BatchStatus::Wait,
        ] {
            let parsed: BatchStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }
}
