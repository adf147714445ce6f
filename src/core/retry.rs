//! Bounded retry with an inter-attempt delay and an optional overall
//! deadline, driven by an injectable [`Clock`].

use std::future::Future;
use std::time::Duration;
use crate::core::clock::Clock;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
    /// Budget for all attempts and delays together. An attempt still in
    /// flight when it runs out is abandoned (its future is dropped).
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted { attempts: u32, last: E },
    TimedOut { attempts: u32, elapsed: Duration, last: Option<E> },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::TimedOut { attempts, .. } => *attempts,
        }
    }
}

/// Runs `op` until it succeeds, the attempt count is spent, or the deadline
/// passes. `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = clock.elapsed();
    let max_attempts = policy.max_attempts.max(1);
    let mut last = None;
    let mut attempt = 0;

    loop {
        let remaining = match policy.timeout {
            Some(limit) => {
                let spent = clock.elapsed().saturating_sub(started);
                if spent >= limit {
                    return Err(RetryError::TimedOut { attempts: attempt, elapsed: spent, last });
                }
                Some(limit - spent)
            }
            None => None,
        };

        attempt += 1;
        let outcome = match remaining {
            Some(remaining) => {
                tokio::select! {
                    biased;
                    result = op(attempt) => Some(result),
                    _ = clock.sleep(remaining) => None,
                }
            }
            None => Some(op(attempt).await),
        };

        match outcome {
            Some(Ok(value)) => return Ok(value),
            Some(Err(e)) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted { attempts: attempt, last: e });
            }
            Some(Err(e)) => {
                last = Some(e);
                clock.sleep(policy.delay).await;
            }
            None => {
                let elapsed = clock.elapsed().saturating_sub(started);
                return Err(RetryError::TimedOut { attempts: attempt, elapsed, last });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let clock = ManualClock::new();
        let policy = RetryPolicy::new(5, Duration::from_millis(250));

        let result: Result<u32, RetryError<&str>> = retry(&policy, &clock, |attempt| async move {
            if attempt < 3 { Err("not yet") } else { Ok(attempt) }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        // two delays between three attempts
        assert_eq!(clock.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(4, Duration::from_millis(10));

        let result: Result<(), RetryError<u32>> = retry(&policy, &clock, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(attempt) }
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last, 4);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn deadline_abandons_hanging_attempt() {
        let clock = ManualClock::new();
        let policy = RetryPolicy::new(10, Duration::from_millis(250))
            .with_timeout(Duration::from_secs(12));

        let result: Result<(), RetryError<()>> = retry(&policy, &clock, |_| async {
            std::future::pending::<Result<(), ()>>().await
        })
        .await;

        match result {
            Err(RetryError::TimedOut { attempts, elapsed, last }) => {
                assert_eq!(attempts, 1);
                assert_eq!(elapsed, Duration::from_secs(12));
                assert!(last.is_none());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn deadline_checked_between_slow_attempts() {
        let clock = ManualClock::new();
        let policy = RetryPolicy::new(10, Duration::from_millis(250))
            .with_timeout(Duration::from_secs(12));

        // each attempt burns five seconds of virtual time and fails
        let result: Result<(), RetryError<&str>> = retry(&policy, &clock, |_| {
            clock.advance(Duration::from_secs(5));
            async { Err("rejected") }
        })
        .await;

        match result {
            Err(RetryError::TimedOut { attempts, last, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, Some("rejected"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
