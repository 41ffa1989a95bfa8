//! Deadline and renewal arithmetic.

use std::time::Duration;
use std::time::Instant;

/// Smallest renewal period; a zero period would spin.
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(1);

/// Expiry time of something created at `now_ms` that lives for `ttl`.
///
/// # Tiger Style
///
/// - Uses saturating_add to prevent overflow
#[inline]
pub fn compute_expiry_ms(now_ms: u64, ttl: Duration) -> u64 {
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    now_ms.saturating_add(ttl_ms)
}

/// Period of a leader's renewal loop: `ttl / divisor`, at least 1ms.
///
/// A divisor of zero is treated as one.
#[inline]
pub fn renewal_interval(ttl: Duration, divisor: u32) -> Duration {
    (ttl / divisor.max(1)).max(MIN_RENEWAL_INTERVAL)
}

/// Waits longer than this are treated as unbounded.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Deadline of a wait of `timeout` starting at `now`.
///
/// A timeout too large to represent, such as `Duration::MAX`, yields a
/// deadline far enough out to never be reached.
#[inline]
pub fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout).or_else(|| now.checked_add(FAR_FUTURE)).unwrap_or(now)
}

/// How long to sleep before the next attempt of a bounded wait loop.
///
/// Returns `None` once `deadline` has been reached, otherwise the poll
/// interval cut short so the final attempt lands on the deadline.
#[inline]
pub fn next_poll_delay(now: Instant, deadline: Instant, poll_interval: Duration) -> Option<Duration> {
    let remaining = deadline.checked_duration_since(now)?;
    if remaining.is_zero() {
        return None;
    }
    Some(remaining.min(poll_interval))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_expiry_saturates() {
        assert_eq!(compute_expiry_ms(1_000, Duration::from_millis(500)), 1_500);
        assert_eq!(compute_expiry_ms(u64::MAX - 1, Duration::from_secs(10)), u64::MAX);
    }

    #[test]
    fn test_renewal_interval() {
        assert_eq!(renewal_interval(Duration::from_secs(60), 5), Duration::from_secs(12));
        assert_eq!(renewal_interval(Duration::from_secs(60), 0), Duration::from_secs(60));
        assert_eq!(renewal_interval(Duration::from_millis(3), 10), Duration::from_millis(1));
    }

    #[test]
    fn test_poll_delay_shrinks_to_deadline() {
        let now = Instant::now();
        let deadline = now + Duration::from_millis(30);
        assert_eq!(next_poll_delay(now, deadline, Duration::from_millis(100)), Some(Duration::from_millis(30)));
        assert_eq!(next_poll_delay(now, deadline, Duration::from_millis(10)), Some(Duration::from_millis(10)));
        assert_eq!(next_poll_delay(deadline, deadline, Duration::from_millis(10)), None);
        assert_eq!(next_poll_delay(deadline + Duration::from_millis(1), deadline, Duration::from_millis(10)), None);
    }

    #[test]
    fn test_deadline_after_saturates() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_millis(5)), now + Duration::from_millis(5));
        let forever = deadline_after(now, Duration::MAX);
        assert!(forever >= now + FAR_FUTURE);
        assert!(next_poll_delay(now, forever, Duration::from_millis(10)).is_some());
    }

    proptest! {
        #[test]
        fn prop_renewal_is_shorter_than_ttl(ttl_ms in 2u64..10_000_000, divisor in 2u32..100) {
            let ttl = Duration::from_millis(ttl_ms);
            let interval = renewal_interval(ttl, divisor);
            prop_assert!(interval < ttl);
            prop_assert!(interval >= MIN_RENEWAL_INTERVAL);
        }

        #[test]
        fn prop_poll_delay_never_overshoots(remaining_ms in 0u64..100_000, poll_ms in 1u64..10_000) {
            let now = Instant::now();
            let deadline = now + Duration::from_millis(remaining_ms);
            match next_poll_delay(now, deadline, Duration::from_millis(poll_ms)) {
                Some(delay) => {
                    prop_assert!(delay <= Duration::from_millis(remaining_ms));
                    prop_assert!(delay <= Duration::from_millis(poll_ms));
                    prop_assert!(!delay.is_zero());
                }
                None => prop_assert_eq!(remaining_ms, 0),
            }
        }
    }
}
