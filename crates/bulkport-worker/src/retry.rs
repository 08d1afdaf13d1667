//! Capped exponential backoff with jitter
//!
//! Shared by lock acquisition and per-URL transfer retries.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Upper bound of the delay before retry number `attempt` (1-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max)
    }

    /// Delay before retry number `attempt` (1-based)
    ///
    /// With jitter the delay is drawn uniformly from the upper half of the
    /// ceiling, so callers that collided once spread out on the next try.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if !self.jitter {
            return ceiling;
        }

        let ceiling_ms = ceiling.as_millis() as u64;
        let half = ceiling_ms / 2;
        let jittered = half + rand::rng().random_range(0..=ceiling_ms - half);
        Duration::from_millis(jittered)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_then_caps() {
        let backoff = Backoff::new(Duration::from_millis(50), Duration::from_millis(300));
        assert_eq!(backoff.ceiling(1), Duration::from_millis(50));
        assert_eq!(backoff.ceiling(2), Duration::from_millis(100));
        assert_eq!(backoff.ceiling(3), Duration::from_millis(200));
        assert_eq!(backoff.ceiling(4), Duration::from_millis(300));
        assert_eq!(backoff.ceiling(40), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_in_upper_half() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        for attempt in 1..8 {
            let ceiling = backoff.ceiling(attempt);
            let delay = backoff.delay(attempt);
            assert!(delay <= ceiling, "{:?} > {:?}", delay, ceiling);
            assert!(delay >= ceiling / 2, "{:?} < half of {:?}", delay, ceiling);
        }
    }

    #[test]
    fn test_without_jitter_is_deterministic() {
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(80)).without_jitter();
        assert_eq!(backoff.delay(3), Duration::from_millis(40));
    }

    #[test]
    fn test_max_never_below_base() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_millis(10));
        assert_eq!(backoff.ceiling(1), Duration::from_millis(500));
    }
}
