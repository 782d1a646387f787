use rand::Rng;
use std::time::Duration;

/// Exponential delay between failed daemon passes. With jitter the delay is
/// drawn from the upper half of the exponential step so it never collapses
/// to zero.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let step = base_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(max_ms);
        if !self.jitter || step < 2 {
            return Duration::from_millis(step);
        }
        let half = step / 2;
        Duration::from_millis(half + rng.gen_range(0..=step - half))
    }
}

/// Consecutive-failure counter feeding a [`Backoff`].
#[derive(Debug, Clone)]
pub struct FailureStreak {
    backoff: Backoff,
    failures: u32,
}

impl FailureStreak {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Registers one more failure and returns how long to wait before the
    /// next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.backoff.delay(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn delay_doubles_until_capped() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), false);
        let mut rng = StdRng::seed_from_u64(7);
        let delays: Vec<u64> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn jitter_stays_in_upper_half_of_step() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(60), true);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..32 {
            let delay = backoff.delay_with_rng(3, &mut rng);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(800));
        }
    }

    #[test]
    fn cap_below_base_is_raised_to_base() {
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(1), false);
        assert_eq!(backoff.delay(4), Duration::from_secs(2));
    }

    #[test]
    fn streak_grows_and_resets() {
        let mut streak = FailureStreak::new(Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(1000),
            false,
        ));
        assert_eq!(streak.next_delay(), Duration::from_millis(10));
        assert_eq!(streak.next_delay(), Duration::from_millis(20));
        assert_eq!(streak.failures(), 2);
        streak.reset();
        assert_eq!(streak.next_delay(), Duration::from_millis(10));
    }
}
