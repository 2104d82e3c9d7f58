//! Fail-open utilities for graceful degradation
//!
//! Infrastructure side effects must never take down scheduling. Use these
//! wrappers for snapshot emission, lifecycle broadcast to presentation
//! subscribers, and similar non-critical operations.
//!
//! DO NOT use fail-open for:
//! - The assignment transaction (correctness)
//! - State-machine transitions (state)
//! - Dead-letter recording (the retry cap must be absolute)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open (infrastructure, not scheduling)
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// # Examples of appropriate use:
/// - Snapshot emission to the persistence collaborator
/// - Lifecycle event broadcast when no subscriber is listening
/// - Stuck-task reporting
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Like fail_open but with linear backoff retries
///
/// Retries the operation up to `max_retries` times; the delay before
/// attempt N is `100ms * N`.
pub async fn fail_open_with_retries<F, Fut, T>(
    operation_name: &str,
    mut f: F,
    max_retries: usize,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=max_retries {
        match f().await {
            Ok(val) => return Some(val),
            Err(e) => {
                if attempt == max_retries {
                    warn!(
                        "{} failed after {} retries (fail-open): {}",
                        operation_name, max_retries, e
                    );
                    return None;
                }
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, max_retries, e
                );
                let delay_ms = 100 * attempt as u64;
                tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DroverError;

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("test_op", || async { Ok::<_, DroverError>(42) }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_fail_open_failure() {
        let result = fail_open("test_op", || async {
            Err::<i32, _>(DroverError::Other("test error".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_fail_open_with_retries_success_after_retry() {
        let mut attempts = 0;
        let result = fail_open_with_retries(
            "test_op",
            || {
                attempts += 1;
                async move {
                    if attempts < 2 {
                        Err(DroverError::Other("transient error".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            },
            3,
        )
        .await;
        assert_eq!(result, Some(42));
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_fail_open_with_retries_all_failures() {
        let mut attempts = 0;
        let result = fail_open_with_retries(
            "test_op",
            || {
                attempts += 1;
                async move { Err::<i32, _>(DroverError::Other("persistent error".to_string())) }
            },
            3,
        )
        .await;
        assert_eq!(result, None);
        assert_eq!(attempts, 3);
    }
}
