use rand::{thread_rng, Rng};
use tokio::time::Duration;

/// An exponential backoff schedule with jitter.
///
/// `next(retries)` grows by `multiplier` per retry, clamped to
/// `max_interval`, and is then spread by `±randomization` so that many
/// endpoints quarantined together do not probe in lockstep.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: u32,
    pub randomization: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(60),
            multiplier: 2,
            randomization: 0.5,
        }
    }
}

impl ExponentialBackoff {
    /// Returns the wait before the `retries + 1`-th attempt.
    pub fn next(&self, retries: u32) -> Duration {
        let mut interval = self.initial_interval;
        for _ in 0..retries {
            if interval >= self.max_interval {
                break;
            }
            interval = std::cmp::min(
                interval.saturating_mul(self.multiplier),
                self.max_interval,
            );
        }
        self.add_spread(interval)
    }

    fn add_spread(&self, interval: Duration) -> Duration {
        if self.randomization <= 0.0 {
            return interval;
        }
        let delta = interval.mul_f64(self.randomization);
        if delta.is_zero() {
            return interval;
        }
        let floor = interval.saturating_sub(delta);
        let mut rng = thread_rng();
        let offset = rng.gen_range(0..=delta.saturating_mul(2).as_nanos());
        floor.saturating_add(Duration::from_nanos(offset.try_into().unwrap_or(u64::MAX)))
    }
}
