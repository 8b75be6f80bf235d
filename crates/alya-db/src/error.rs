use std::fmt;

/// Store-level error kinds exposed to the engine (§4.A, §7).
///
/// Hand-written `Display` + `std::error::Error` rather than a derive macro,
/// so callers can match on kind precisely.
#[derive(Debug)]
pub enum StoreError {
    /// The referenced batch/row does not exist.
    NotFound,
    /// The batch is already in a terminal state; the attempted mutation is
    /// rejected rather than silently accepted.
    AlreadyTerminal,
    /// A uniqueness or precondition violation other than `AlreadyTerminal`
    /// (duplicate `(batch_id, line)`, finalizing a non-`in_progress` row).
    Conflict,
    /// The store could not be reached after exhausting retries (§7).
    StoreUnavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "STORE_NOT_FOUND: no matching row"),
            StoreError::AlreadyTerminal => {
                write!(f, "STORE_ALREADY_TERMINAL: batch is already in a terminal state")
            }
            StoreError::Conflict => write!(f, "STORE_CONFLICT: precondition not met"),
            StoreError::StoreUnavailable(detail) => {
                write!(f, "STORE_UNAVAILABLE: {detail}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db_err) => {
                // Postgres SQLSTATE 23505 = unique_violation.
                if db_err.code().as_deref() == Some("23505") {
                    StoreError::Conflict
                } else {
                    StoreError::StoreUnavailable(db_err.to_string())
                }
            }
            other => StoreError::StoreUnavailable(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
