//! Bounded polling for transaction confirmation.
//!
//! Chain adapters that relay pre-signed transactions cannot block forever
//! waiting for finality. [`poll`] drives a probe closure under an explicit
//! attempt budget, and [`BackoffPolicy`] shapes retry delays for the
//! webhook dispatcher and indexer backoff.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Attempt budget and pacing for a confirmation poll.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl PollConfig {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Worst-case wall-clock bound of the whole poll.
    pub fn deadline(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// What a single probe observed.
#[derive(Debug)]
pub enum PollStatus<T, E> {
    /// Not confirmed yet; try again after the standard interval.
    Pending,
    /// Not confirmed yet; the remote asked us to wait this long (e.g. a
    /// rate-limit `Retry-After`).
    Wait(Duration),
    /// Terminal success.
    Confirmed(T),
    /// Terminal failure; polling stops immediately.
    Failed(E),
}

/// Terminal outcome of a poll.
#[derive(Debug)]
pub enum PollOutcome<T, E> {
    Confirmed(T),
    Failed(E),
    /// Attempt budget exhausted without a terminal answer.
    TimedOut,
}

impl<T, E> PollOutcome<T, E> {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, PollOutcome::Confirmed(_))
    }
}

/// Run `probe` up to `config.max_attempts` times, sleeping between
/// attempts. The probe receives the 1-based attempt number.
pub async fn poll<T, E, F, Fut>(config: PollConfig, mut probe: F) -> PollOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = PollStatus<T, E>>,
{
    for attempt in 1..=config.max_attempts {
        match probe(attempt).await {
            PollStatus::Confirmed(value) => return PollOutcome::Confirmed(value),
            PollStatus::Failed(error) => return PollOutcome::Failed(error),
            PollStatus::Pending => {
                if attempt < config.max_attempts {
                    tokio::time::sleep(config.interval).await;
                }
            }
            PollStatus::Wait(duration) => {
                if attempt < config.max_attempts {
                    tokio::time::sleep(duration).await;
                }
            }
        }
    }
    PollOutcome::TimedOut
}

/// Exponential backoff with a cap and jitter, for delivery retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomized away, in `[0, 1]`.
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.1,
        }
    }

    /// Delay before the given 1-based retry attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        if self.jitter <= 0.0 {
            return capped;
        }
        let factor = 1.0 - rand::rng().random_range(0.0..self.jitter);
        capped.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn confirms_once_probe_succeeds() {
        let config = PollConfig::new(5, Duration::from_secs(10));
        let outcome: PollOutcome<u32, ()> = poll(config, |attempt| async move {
            if attempt >= 3 {
                PollStatus::Confirmed(attempt)
            } else {
                PollStatus::Pending
            }
        })
        .await;
        match outcome {
            PollOutcome::Confirmed(attempt) => assert_eq!(attempt, 3),
            other => panic!("expected confirmation, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_terminal() {
        let config = PollConfig::new(5, Duration::from_secs(10));
        let outcome: PollOutcome<(), &str> = poll(config, |attempt| async move {
            if attempt == 2 {
                PollStatus::Failed("aborted")
            } else {
                PollStatus::Pending
            }
        })
        .await;
        match outcome {
            PollOutcome::Failed(reason) => assert_eq!(reason, "aborted"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_time_out() {
        let config = PollConfig::new(30, Duration::from_secs(10));
        let start = tokio::time::Instant::now();
        let outcome: PollOutcome<(), ()> =
            poll(config, |_| async { PollStatus::Pending }).await;
        assert!(matches!(outcome, PollOutcome::TimedOut));
        // 30 attempts with 29 sleeps in between.
        assert_eq!(start.elapsed(), Duration::from_secs(290));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_overrides_standard_interval() {
        let config = PollConfig::new(3, Duration::from_secs(10));
        let start = tokio::time::Instant::now();
        let outcome: PollOutcome<(), ()> = poll(config, |attempt| async move {
            if attempt == 1 {
                PollStatus::Wait(Duration::from_secs(60))
            } else {
                PollStatus::Confirmed(())
            }
        })
        .await;
        assert!(outcome.is_confirmed());
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut policy =
            BackoffPolicy::new(5, Duration::from_secs(1), Duration::from_secs(30));
        policy.jitter = 0.0;
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = BackoffPolicy::new(5, Duration::from_secs(1), Duration::from_secs(30));
        for attempt in 1..20 {
            assert!(policy.delay(attempt) <= Duration::from_secs(30));
        }
    }
}
