//! Document-store access for the sheet sync: retry controller, store contract,
//! Google Sheets client, and an in-memory store.

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use sheetsync_core::SyncError;
use tracing::warn;

mod auth;
mod google;
mod memory;
mod store;

pub use auth::{load_token_provider_from_env, ServiceAccountKey, ServiceAccountTokens, StaticToken, TokenProvider};
pub use google::{GoogleSheetsConfig, GoogleSheetsStore};
pub use memory::{MemoryDocumentStore, StoreOp, WriteRecord};
pub use store::DocumentStore;

pub const CRATE_NAME: &str = "sheetsync-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Client errors are final except 408 and 429; every other status may be retried.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_client_error()
        && status != StatusCode::TOO_MANY_REQUESTS
        && status != StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

/// Malformed requests and undecodable bodies are final; transport failures are not.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_builder() || err.is_decode() {
        return RetryDisposition::NonRetryable;
    }
    match err.status() {
        Some(status) => classify_status(status),
        None => RetryDisposition::Retryable,
    }
}

/// Maps a transport error onto the sync error taxonomy.
pub fn sync_error_from_reqwest(operation: &str, err: reqwest::Error) -> SyncError {
    match classify_reqwest_error(&err) {
        RetryDisposition::Retryable => SyncError::transient(operation, err),
        RetryDisposition::NonRetryable => SyncError::rejected(operation, err),
    }
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(3000),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Used for operations that are unsafe to repeat, such as appends.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, or the attempt cap is reached.
///
/// Only [`SyncError::is_retryable`] failures are retried. A transient failure that
/// outlives the cap surfaces as [`SyncError::RetriesExhausted`].
pub async fn retry_with<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                warn!(operation, attempt, max_attempts, error = %err, "transient failure, retrying");
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) if err.is_retryable() => {
                return Err(SyncError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    message: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetsync_core::ErrorClass;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn always_transient_is_attempted_max_times_with_fixed_delay() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(5000));
        let started = tokio::time::Instant::now();

        let result: Result<(), _> = retry_with(&policy, "fetch metrics", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::transient("fetch metrics", "connection reset"))
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.class(), ErrorClass::FatalAfterRetry);
        assert!(matches!(err, SyncError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(started.elapsed(), Duration::from_millis(10_000));
    }

    #[tokio::test]
    async fn permanent_errors_are_attempted_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with(&RetryPolicy::default(), "update", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::InvalidDateKey("2025-13-01".into()))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err(), SyncError::InvalidDateKey("2025-13-01".into()));
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let value = retry_with(&policy, "read", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(SyncError::transient("read", "503"))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn single_attempt_never_repeats() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with(&RetryPolicy::single_attempt(), "append", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::transient("append", "timeout"))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(SyncError::RetriesExhausted { attempts: 1, .. })));
    }

    #[test]
    fn status_classification_matches_retry_contract() {
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
    }

    #[test]
    fn malformed_requests_are_not_retried() {
        let err = reqwest::Client::new().get("not a url").build().unwrap_err();
        assert_eq!(classify_reqwest_error(&err), RetryDisposition::NonRetryable);
        assert!(!sync_error_from_reqwest("read range", err).is_retryable());
    }
}
