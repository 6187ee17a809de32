//! Bounded exponential backoff shared by the paginated fetch and the
//! narrative call.

use crate::error::SourceError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Upper bound on any single wait, including server-provided hints.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 16_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryFailure {
    /// A non-transient error; no further attempts were made.
    #[error("{0}")]
    Fatal(SourceError),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: SourceError },
}

impl RetryPolicy {
    /// No waiting between attempts.
    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            backoff_multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Wait before retry number `retry` (0 for the wait after the first failure).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(retry as i32);
        let ms = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let attempts = self.attempts();
        let mut attempt = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempt += 1;

            if !err.is_transient() {
                return Err(RetryFailure::Fatal(err));
            }
            if attempt >= attempts {
                return Err(RetryFailure::Exhausted {
                    attempts,
                    last: err,
                });
            }

            let mut wait = self.delay_for(attempt - 1);
            if let Some(hint) = err.retry_after() {
                wait = wait.max(hint).min(Duration::from_millis(self.max_delay_ms));
            }
            warn!(
                what = %what,
                attempt = attempt,
                max_attempts = attempts,
                backoff_ms = wait.as_millis() as u64,
                error = %err,
                "Transient failure, backing off"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_retries_transient_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = RetryPolicy::immediate(3)
            .run("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SourceError::RateLimited { retry_after: None })
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_stops_after_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = RetryPolicy::immediate(4)
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::Transport("reset".into()))
            })
            .await;
        assert!(matches!(result, Err(RetryFailure::Exhausted { attempts: 4, .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_fatal_status() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = RetryPolicy::immediate(5)
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::Status {
                    status: 400,
                    body: "bad symbol".into(),
                })
            })
            .await;
        assert!(matches!(result, Err(RetryFailure::Fatal(SourceError::Status { status: 400, .. }))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
