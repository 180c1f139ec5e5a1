use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY_MILLIS: u64 = 60 * 1_000;
/// Jitter applied on both sides of the base delay, as a fraction of it.
pub const JITTER_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MILLIS),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MILLIS),
        }
    }
}

/// Applies +/- `JITTER_FACTOR` jitter to `base`, never returning a negative delay.
pub fn jittered_delay(base: Duration) -> Duration {
    jittered_delay_with_rng(base, &mut rand::thread_rng())
}

pub(crate) fn jittered_delay_with_rng<R: Rng + ?Sized>(base: Duration, rng: &mut R) -> Duration {
    let base_millis = base.as_millis() as f64;
    let jitter = JITTER_FACTOR * base_millis * rng.gen_range(-1.0..=1.0);
    Duration::from_millis((base_millis + jitter).round().max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn jitter_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let value = jittered_delay_with_rng(Duration::from_millis(1_000), &mut rng);
            assert!(value >= Duration::from_millis(500));
            assert!(value <= Duration::from_millis(1_500));
        }
    }

    #[test]
    fn zero_base_has_no_jitter() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(
            jittered_delay_with_rng(Duration::ZERO, &mut rng),
            Duration::ZERO
        );
    }
}
