//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `attempt` (1-based; attempt 0 is immediate).
///
/// Doubles from `base` and caps at `max`, then adds up to 10% jitter.
#[must_use]
pub fn delay_for(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let factor = 2u32.saturating_pow(attempt - 1);
    let capped = base.saturating_mul(factor).min(max);

    let jitter_ms = u64::try_from(capped.as_millis() / 10).unwrap_or(u64::MAX);
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(rand::rng().random_range(0..jitter_ms))
    } else {
        Duration::ZERO
    };

    capped.saturating_add(jitter)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(2);

    #[test]
    fn first_attempt_is_immediate() {
        assert_eq!(delay_for(0, BASE, MAX), Duration::ZERO);
    }

    #[test]
    fn grows_exponentially_within_jitter() {
        for (attempt, expected) in [(1, 100), (2, 200), (3, 400), (4, 800)] {
            let delay = delay_for(attempt, BASE, MAX);
            let expected = Duration::from_millis(expected);
            assert!(delay >= expected, "attempt {attempt}: {delay:?}");
            assert!(delay <= expected + expected / 10, "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn capped_at_max() {
        let delay = delay_for(30, BASE, MAX);
        assert!(delay >= MAX);
        assert!(delay <= MAX + MAX / 10);
    }

    #[test]
    fn tiny_base_has_no_jitter() {
        let delay = delay_for(1, Duration::from_millis(5), MAX);
        assert_eq!(delay, Duration::from_millis(5));
    }
}
