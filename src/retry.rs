//! Reconnect backoff and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. The stream session uses
//! them to pace reconnect attempts and to bound handshake and close waits.

use std::future::Future;
use std::time::Duration;

/// Delay before the first reconnect attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);
/// Upper bound for reconnect delay growth.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);
/// Floor applied to both bounds so a failing endpoint is never retried in a
/// tight loop.
pub const MIN_DELAY: Duration = Duration::from_millis(1);

/// Policy controlling the exponential reconnect backoff.
///
/// There is no attempt cap and no jitter: the session retries until it is
/// stopped, and the delay sequence is fully deterministic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay used before the first reconnect attempt.
    pub base_delay: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Creates a policy with explicit bounds, each raised to at least
    /// [`MIN_DELAY`].
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay: base_delay.max(MIN_DELAY),
            max_delay: max_delay.max(MIN_DELAY),
        }
    }

    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based: the first reconnect waits `base_delay`, and each
    /// following attempt doubles the delay up to `max_delay`. Attempt `0`
    /// means no failure has happened yet and yields a zero delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let max_delay = self.max_delay.max(MIN_DELAY);
        let mut delay = self.base_delay.max(MIN_DELAY);
        for _ in 1..attempt {
            if delay >= max_delay {
                break;
            }
            delay = delay.saturating_mul(2);
        }
        std::cmp::min(delay, max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{with_timeout, ReconnectPolicy, MIN_DELAY};

    #[test]
    fn default_policy_doubles_up_to_ceiling() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=8)
            .map(|attempt| policy.delay_for_attempt(attempt).as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000]
        );
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        assert_eq!(
            ReconnectPolicy::default().delay_for_attempt(0),
            Duration::ZERO
        );
    }

    #[test]
    fn huge_attempt_counts_stay_at_ceiling() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.delay_for_attempt(u32::MAX),
            Duration::from_millis(30_000)
        );
    }

    #[test]
    fn base_above_ceiling_is_clamped() {
        let policy = ReconnectPolicy::new(Duration::from_secs(60), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
    }

    #[test]
    fn zero_bounds_are_raised_to_floor() {
        let policy = ReconnectPolicy::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.base_delay, MIN_DELAY);
        assert_eq!(policy.delay_for_attempt(1), MIN_DELAY);
        assert_eq!(policy.delay_for_attempt(5), MIN_DELAY);

        let policy = ReconnectPolicy::new(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(16));
    }

    #[test]
    fn literal_zero_policy_still_waits() {
        let policy = ReconnectPolicy {
            base_delay: Duration::ZERO,
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4));
    }

    #[test]
    fn timeout_elapses_for_pending_future() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let result = with_timeout(
                Duration::from_millis(10),
                std::future::pending::<()>(),
            )
            .await;
            assert!(result.is_err());

            let result = with_timeout(Duration::from_millis(10), async { 7 }).await;
            assert_eq!(result.expect("completes in time"), 7);
        });
    }
}
