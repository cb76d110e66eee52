use crate::error::MonitorError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, warn};

/// Fixed-interval polling with an immediate first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Every attempt failed before the deadline.
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: MonitorError,
}

impl RetryPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Runs `action` until it succeeds or `timeout` has elapsed since the
    /// first attempt. Failures are logged with the operation name.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        mut action: F,
    ) -> std::result::Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempts = 0;

        loop {
            attempts += 1;
            match action().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    error!(operation, attempt = attempts, error = %e, "Failed to {}", operation);

                    let now = Instant::now();
                    if now >= deadline || e.is_fatal() {
                        return Err(RetryExhausted {
                            attempts,
                            last_error: e,
                        });
                    }
                    tokio::time::sleep(self.interval.min(deadline - now)).await;
                }
            }
        }
    }

    /// Like [`RetryPolicy::run`] but maps exhaustion to a `QueryTimeout`
    /// naming the operation.
    pub async fn query<T, F, Fut>(&self, operation: &str, action: F) -> crate::error::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        self.run(operation, action).await.map_err(|exhausted| {
            warn!(
                operation,
                attempts = exhausted.attempts,
                timeout = ?self.timeout,
                "Giving up on {}",
                operation
            );
            MonitorError::QueryTimeout {
                operation: operation.to_string(),
                timeout: self.timeout,
                last_error: exhausted.last_error.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_is_immediate() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10));
        let start = Instant::now();

        let value = policy.query("noop", || async { Ok(7) }).await.unwrap();

        assert_eq!(value, 7);
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10));
        let calls = AtomicU32::new(0);

        let value = policy
            .query("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(MonitorError::Database("not yet".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_names_operation() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10));
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let err = policy
            .query("get row count", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(MonitorError::Database("down".into())) }
            })
            .await
            .unwrap_err();

        match err {
            MonitorError::QueryTimeout { operation, last_error, .. } => {
                assert_eq!(operation, "get row count");
                assert!(last_error.contains("down"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 11);
        assert_eq!(Instant::now() - start, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_retrying() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10));
        let calls = AtomicU32::new(0);

        let exhausted = policy
            .run("fatal", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(MonitorError::InvariantViolation("bad".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(exhausted.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
