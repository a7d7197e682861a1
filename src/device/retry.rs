//! Retry policy for card requests
//!
//! Only a refused request (`ConnectionUnable`) is retried, and only while
//! waiting for response headers. Once the body starts streaming a failure is
//! final, because the card cannot resume a partial transfer.

use crate::core::error::{Result, SyncError};
use log::debug;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Fixed pause between attempts
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Run `attempt` until it succeeds, fails terminally, or retries run out
    ///
    /// `attempt` receives the zero-based attempt number. The backoff sleep is
    /// abandoned as soon as `cancel` fires.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut number = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Canceled);
            }

            match attempt(number).await {
                Err(e) if e.is_retryable() && number < self.max_retries => {
                    debug!(
                        "Attempt {} failed ({}), retrying in {:?}",
                        number + 1,
                        e,
                        self.backoff
                    );
                    number += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Canceled),
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tokio::time::Instant;

    fn unable() -> SyncError {
        SyncError::ConnectionUnable("HTTP 500".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt_after_two_waits() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let attempts = Cell::new(0u32);
        let started = Instant::now();

        let result = policy
            .run(&cancel, |n| {
                attempts.set(attempts.get() + 1);
                async move {
                    if n < 2 {
                        Err(unable())
                    } else {
                        Ok("listing")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "listing");
        assert_eq!(attempts.get(), 3);
        assert_eq!(started.elapsed(), policy.backoff * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_four_failures_exhaust_retries() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let attempts = Cell::new(0u32);
        let started = Instant::now();

        let result: Result<()> = policy
            .run(&cancel, |_| {
                attempts.set(attempts.get() + 1);
                async { Err(unable()) }
            })
            .await;

        assert!(matches!(result, Err(SyncError::ConnectionUnable(_))));
        assert_eq!(attempts.get(), 4);
        assert_eq!(started.elapsed(), policy.backoff * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let attempts = Cell::new(0u32);

        let result: Result<()> = policy
            .run(&cancel, |_| {
                attempts.set(attempts.get() + 1);
                async { Err(SyncError::RemoteFileNotFound("/DCIM/A.JPG".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(SyncError::RemoteFileNotFound(_))));
        assert_eq!(attempts.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_secs(60),
        };
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();

        let result: Result<()> = policy
            .run(&cancel, |_| {
                canceller.cancel();
                async { Err(unable()) }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Canceled)));
    }
}
