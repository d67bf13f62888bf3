use std::{future::Future, time::Duration};

use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};

use crate::api::ApiError;

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RetryError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("gave up after {elapsed:?}{}", describe_last(.last.as_ref()))]
    TimedOut {
        elapsed: Duration,
        last: Option<ApiError>,
    },
}

fn describe_last(last: Option<&ApiError>) -> String {
    last.map_or_else(String::new, |err| format!(", last error: {err}"))
}

/// Bounded exponential backoff with an overall deadline.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Deadline for all attempts and the waits between them.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_MULTIPLIER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_attempts: 1,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Delay before retry number `attempt` (0 is the first retry).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if delay.is_finite() && delay < self.max_backoff.as_secs_f64() {
            Duration::from_secs_f64(delay)
        } else {
            self.max_backoff
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, runs out of attempts
/// or exceeds the policy deadline.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    description: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let start = Instant::now();
    let mut attempt = 0;
    loop {
        let remaining = policy.timeout.saturating_sub(start.elapsed());
        let err = match timeout(remaining, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => {
                error!("{description} did not finish before the retry deadline");
                return Err(RetryError::TimedOut {
                    elapsed: start.elapsed(),
                    last: None,
                });
            }
        };

        attempt += 1;
        if !err.is_transient() || attempt >= policy.max_attempts {
            return Err(err.into());
        }

        let delay = policy.backoff(attempt - 1);
        if start.elapsed() + delay > policy.timeout {
            error!(
                "{description} failed and the next attempt would exceed the retry deadline of {:?}: {err}",
                policy.timeout
            );
            return Err(RetryError::TimedOut {
                elapsed: start.elapsed(),
                last: Some(err),
            });
        }
        warn!(
            "{description} failed (attempt {attempt}/{}), retrying in {delay:?}: {err}",
            policy.max_attempts
        );
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use matches::assert_matches;

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_attempts: 4,
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_secs(1));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_throttling() {
        let calls = &AtomicU32::new(0);
        let result = retry(&policy(), "get_group", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ApiError::Throttled("slow down".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_does_not_retry_final_errors() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = retry(&policy(), "get_group", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::no_such_group("admins"))
        })
        .await;
        assert_matches!(result, Err(RetryError::Api(ApiError::NoSuchEntity { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = retry(&policy(), "add_member", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::Transport("connection reset".into()))
        })
        .await;
        assert_matches!(result, Err(RetryError::Api(ApiError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reports_deadline() {
        let policy = RetryPolicy {
            max_attempts: 100,
            timeout: Duration::from_millis(250),
            ..policy()
        };
        let result: Result<(), _> = retry(&policy, "remove_member", || async {
            Err(ApiError::Throttled("slow down".into()))
        })
        .await;
        assert_matches!(
            result,
            Err(RetryError::TimedOut {
                last: Some(ApiError::Throttled(_)),
                ..
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bounds_hanging_call() {
        let policy = RetryPolicy {
            timeout: Duration::from_secs(1),
            ..policy()
        };
        let result: Result<(), _> = retry(&policy, "get_group", || async {
            sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert_matches!(result, Err(RetryError::TimedOut { last: None, .. }));
    }
}
