use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Time source for retry loops; swapped for a manual clock in tests.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Bounded retry: stop at `max_attempts` failures or once `max_elapsed` has
/// passed since the first attempt, whichever binds first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_elapsed: Duration,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_elapsed: Duration::from_secs(10),
            interval: Duration::from_secs(1),
        }
    }
}

/// Outcome of a single attempt as classified by the caller.
#[derive(Debug)]
pub enum AttemptError<E> {
    Transient(E),
    Permanent(E),
}

#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted {
        last: E,
        attempts: u32,
        elapsed: Duration,
    },
    Aborted {
        error: E,
        attempts: u32,
    },
}

#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn should_retry(&self, failures: u32, elapsed: Duration) -> bool {
        failures < self.max_attempts && elapsed < self.max_elapsed
    }

    /// Run `op` until it succeeds, fails permanently, or the policy's ceilings
    /// are reached. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(
        &self,
        clock: &dyn Clock,
        mut op: F,
    ) -> Result<Retried<T>, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError<E>>>,
        E: Display,
    {
        let started = clock.now();
        let mut failures: u32 = 0;
        loop {
            let attempt = failures + 1;
            match op(attempt).await {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    });
                }
                Err(AttemptError::Permanent(error)) => {
                    return Err(RetryError::Aborted {
                        error,
                        attempts: attempt,
                    });
                }
                Err(AttemptError::Transient(error)) => {
                    failures = attempt;
                    let elapsed = clock.now().saturating_duration_since(started);
                    if !self.should_retry(failures, elapsed) {
                        return Err(RetryError::Exhausted {
                            last: error,
                            attempts: failures,
                            elapsed,
                        });
                    }
                    tracing::warn!(
                        target: "sqlbot::retry",
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        error = %error,
                        "transient failure, retrying"
                    );
                    clock.sleep(self.interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;

    #[test]
    fn ceilings() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(9, Duration::from_secs(9)));
        assert!(!policy.should_retry(10, Duration::from_secs(1)));
        assert!(!policy.should_retry(1, Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let clock = ManualClock::new();
        let policy = RetryPolicy::default();
        let result = policy
            .run(&clock, |attempt| async move {
                if attempt <= 4 {
                    Err(AttemptError::Transient(format!("refused #{attempt}")))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(result.attempts, 5);
        assert_eq!(clock.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let clock = ManualClock::new();
        let err = RetryPolicy::default()
            .run(&clock, |_| async {
                Err::<(), _>(AttemptError::Permanent("access denied"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Aborted { attempts: 1, .. }));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn attempt_ceiling_binds() {
        let clock = ManualClock::new();
        let err = RetryPolicy::default()
            .run(&clock, |_| async {
                Err::<(), _>(AttemptError::Transient("refused"))
            })
            .await
            .unwrap_err();
        match err {
            RetryError::Exhausted { attempts, .. } => assert_eq!(attempts, 10),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn elapsed_ceiling_binds() {
        let clock = ManualClock::new();
        let slow = clock.clone();
        let err = RetryPolicy::default()
            .run(&clock, |_| {
                let slow = slow.clone();
                async move {
                    // each attempt burns 2s on top of the 1s interval
                    slow.advance(Duration::from_secs(2));
                    Err::<(), _>(AttemptError::Transient("timeout"))
                }
            })
            .await
            .unwrap_err();
        match err {
            RetryError::Exhausted {
                attempts, elapsed, ..
            } => {
                assert_eq!(attempts, 4);
                assert!(elapsed >= Duration::from_secs(10));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
