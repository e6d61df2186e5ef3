use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Retryable;

/// Exponential backoff: doubles on each step, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            max,
            current: initial.min(max),
        }
    }

    /// Delay to wait now; the following call returns the doubled value
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// Attempt bound, backoff and per-call deadline for external calls
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff, self.max_backoff)
    }

    /// Run `call` until it succeeds, fails permanently, or the attempt
    /// bound is reached. Each attempt is cut off after `call_timeout`.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut call: F) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut backoff = self.backoff();
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(self.call_timeout)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "{} failed: {}",
                        what,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FilterError, ForwardError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            call_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, FilterError> = policy(3)
            .run("classify", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(FilterError::Request("503".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), FilterError> = policy(2)
            .run("classify", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FilterError::Request("down".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_does_not_retry_permanent() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ForwardError> = policy(5)
            .run("forward", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ForwardError::Permanent {
                    reason: "chat not found".into(),
                })
            })
            .await;
        assert!(matches!(result, Err(ForwardError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out_slow_calls() {
        let result: Result<(), FilterError> = policy(1)
            .run("classify", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(FilterError::Timeout(_))));
    }
}
