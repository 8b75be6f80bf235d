use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;

/// Backoff schedule for recoverable store outages (§7): 3 attempts total,
/// waiting 100ms then 400ms then 1.6s between them.
const BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(400),
    Duration::from_millis(1600),
];

/// Retry a fallible store call up to `1 + BACKOFF.len()` times with
/// exponential backoff. Only intended for the transient, network-class
/// failures §7 calls out — callers should not wrap calls that fail for
/// business reasons (e.g. `AlreadyTerminal`), since those will never
/// succeed on retry.
pub async fn with_backoff<T, F, Fut>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(StoreError::StoreUnavailable(msg)) => {
                if attempt >= BACKOFF.len() {
                    return Err(StoreError::StoreUnavailable(msg));
                }
                tokio::time::sleep(BACKOFF[attempt]).await;
                attempt += 1;
            }
            Err(other) => return Err(other),
        }
    }
}
