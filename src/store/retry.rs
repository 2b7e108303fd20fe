//! Retry policy wrapping the leasing layer.
//!
//! Rather than a per-function decorator, a single policy function wraps
//! each store call and backs off only on transient connection failures,
//! never on logical (already-a-valid-query-result) errors.

use std::time::Duration;

use tracing::warn;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);

/// Whether a `sqlx::Error` represents a transient connection problem that is
/// worth retrying, as opposed to a logical/query error that will simply fail
/// again.
pub fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

/// Run `op` up to [`MAX_ATTEMPTS`] times with exponential backoff (2s, 4s,
/// 8s), retrying only on [`is_transient`] errors. Logical errors propagate
/// immediately.
pub async fn with_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0u32;
    let mut delay = INITIAL_BACKOFF;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                warn!(
                    "{op_name}: transient store error on attempt {attempt}/{MAX_ATTEMPTS}: {err}; retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}

/// A closed pool surfacing during [`crate::store::Store::heartbeat`] is
/// benign during shutdown; every other error still propagates.
pub fn is_benign_during_shutdown(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::PoolClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(sqlx::Error::PoolTimedOut)
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_logical_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), sqlx::Error> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pool_closed_is_benign() {
        assert!(is_benign_during_shutdown(&sqlx::Error::PoolClosed));
        assert!(!is_benign_during_shutdown(&sqlx::Error::RowNotFound));
    }
}
