//! Exponential backoff with seeded jitter

#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)] // jitter math runs in f64 milliseconds

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::BackoffConfig;

/// Retry delay schedule: `base * factor^attempt`, capped, then jittered
///
/// The jittered delay never exceeds the cap.
pub struct Backoff {
    config: BackoffConfig,
    rng: Mutex<StdRng>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    /// Delay before the retry that follows `attempt` failed attempts
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_millis(attempt);
        let jitter = self.config.jitter.abs();
        let spread = if jitter > 0.0 {
            // A poisoned RNG only costs us the jitter, not the retry.
            self.rng
                .lock()
                .map_or(0.0, |mut rng| rng.gen_range(-jitter..=jitter))
        } else {
            0.0
        };
        Self::clamp(raw * (1.0 + spread), self.cap_millis())
    }

    /// Smallest and largest delay `delay(attempt)` can return
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        let raw = self.raw_millis(attempt);
        let jitter = self.config.jitter.abs();
        let cap = self.cap_millis();
        (
            Self::clamp(raw * (1.0 - jitter), cap),
            Self::clamp(raw * (1.0 + jitter), cap),
        )
    }

    fn raw_millis(&self, attempt: u32) -> f64 {
        let base = self.config.base.as_millis() as f64;
        let factor = f64::from(self.config.factor.max(1));
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        (base * factor.powi(exponent)).min(self.cap_millis())
    }

    fn cap_millis(&self) -> f64 {
        self.config.cap.as_millis() as f64
    }

    fn clamp(millis: f64, cap: f64) -> Duration {
        Duration::from_millis(millis.clamp(0.0, cap).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(seed: u64) -> Backoff {
        Backoff::new(BackoffConfig {
            seed,
            ..BackoffConfig::default()
        })
    }

    #[test]
    fn delays_double_from_base_without_jitter() {
        let backoff = Backoff::new(BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        });
        let delays: Vec<u64> = (0..5).map(|n| backoff.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(backoff.delay(20), Duration::from_secs(300));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_twenty_percent_and_cap() {
        let backoff = backoff(42);
        for attempt in 0..12 {
            let (low, high) = backoff.bounds(attempt);
            for _ in 0..50 {
                let delay = backoff.delay(attempt);
                assert!(delay >= low && delay <= high, "attempt {attempt}: {delay:?}");
                assert!(delay <= Duration::from_secs(300));
            }
        }

        let (low, high) = backoff.bounds(0);
        assert_eq!(low, Duration::from_millis(800));
        assert_eq!(high, Duration::from_millis(1_200));
    }

    #[test]
    fn same_seed_gives_same_schedule() {
        let first: Vec<Duration> = {
            let backoff = backoff(7);
            (0..8).map(|n| backoff.delay(n)).collect()
        };
        let second: Vec<Duration> = {
            let backoff = backoff(7);
            (0..8).map(|n| backoff.delay(n)).collect()
        };
        let other: Vec<Duration> = {
            let backoff = backoff(8);
            (0..8).map(|n| backoff.delay(n)).collect()
        };
        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[test]
    fn lower_bound_never_decreases() {
        let backoff = backoff(1);
        let mut previous = Duration::ZERO;
        for attempt in 0..20 {
            let (low, _) = backoff.bounds(attempt);
            assert!(low >= previous, "attempt {attempt}");
            previous = low;
        }
    }
}
