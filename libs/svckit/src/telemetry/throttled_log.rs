//! Rate limit for repeated warnings (directory outages, broker reconnects).

use tokio::time::{Duration, Instant};

/// Decides whether a repeated log line may be emitted now.
///
/// Not thread-safe by itself; each background loop owns its own instance.
#[derive(Debug)]
pub struct ThrottledLog {
    every: Duration,
    next: Option<Instant>,
    suppressed: u64,
}

impl ThrottledLog {
    #[must_use]
    pub fn new(every: Duration) -> Self {
        Self {
            every,
            next: None,
            suppressed: 0,
        }
    }

    /// Returns `Some(n)` when logging is allowed, where `n` is how many calls
    /// were suppressed since the last allowed one.
    pub fn check(&mut self) -> Option<u64> {
        let now = Instant::now();
        match self.next {
            Some(next) if now < next => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.next = Some(now + self.every);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }

    /// Forget history so the next [`Self::check`] is allowed immediately.
    pub fn reset(&mut self) {
        self.next = None;
        self.suppressed = 0;
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn suppresses_within_window() {
        let mut throttle = ThrottledLog::new(Duration::from_secs(10));
        assert_eq!(throttle.check(), Some(0));
        assert_eq!(throttle.check(), None);
        assert_eq!(throttle.check(), None);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(throttle.check(), Some(2));
        assert_eq!(throttle.check(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_allows_next_call() {
        let mut throttle = ThrottledLog::new(Duration::from_secs(60));
        assert!(throttle.check().is_some());
        assert!(throttle.check().is_none());
        throttle.reset();
        assert_eq!(throttle.check(), Some(0));
    }
}
