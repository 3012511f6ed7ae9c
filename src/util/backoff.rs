use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::util::duration_millis;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(60 * 1_000);
pub const DEFAULT_JITTER_FACTOR: f64 = 0.5;

/// Shape of the reconnect delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    pub factor: f64,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Each delay is randomized by up to this fraction of the base delay in either direction.
    pub jitter: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER_FACTOR,
        }
    }
}

/// Exponential backoff with jitter.
///
/// The first delay after a reset is zero so that a single transient failure reconnects
/// immediately; every later delay grows by `factor` up to `max_delay`.
#[derive(Debug)]
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current_base: Duration,
    rng: StdRng,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self::with_rng(settings, StdRng::from_entropy())
    }

    pub fn with_rng(settings: BackoffSettings, rng: StdRng) -> Self {
        Self {
            settings,
            current_base: Duration::ZERO,
            rng,
        }
    }

    pub fn settings(&self) -> &BackoffSettings {
        &self.settings
    }

    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Used after `ResourceExhausted`: the next attempt waits the full maximum.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.settings.max_delay;
    }

    /// Delay to wait before the next attempt; advances the curve.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_base.as_secs_f64();
        let jitter = if self.settings.jitter > 0.0 {
            self.rng.gen_range(-1.0..=1.0) * self.settings.jitter * base
        } else {
            0.0
        };
        let delay = bounded_duration(
            base + jitter,
            Duration::ZERO,
            self.settings.max_delay.saturating_mul(2),
        );

        let next = self.current_base.as_secs_f64() * self.settings.factor;
        self.current_base = bounded_duration(next, self.settings.initial_delay, self.settings.max_delay);
        delay
    }
}

/// Seconds as a duration within `[min, max]`. NaN maps to `min`.
fn bounded_duration(secs: f64, min: Duration, max: Duration) -> Duration {
    if secs.is_nan() {
        return min;
    }
    Duration::try_from_secs_f64(secs.max(0.0))
        .unwrap_or(Duration::MAX)
        .max(min)
        .min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(settings: BackoffSettings) -> ExponentialBackoff {
        ExponentialBackoff::with_rng(settings, StdRng::seed_from_u64(42))
    }

    #[test]
    fn first_attempt_is_immediate() {
        let mut backoff = seeded(BackoffSettings::default());
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(500));
        assert!(second <= Duration::from_millis(1_500));
    }

    #[test]
    fn delays_grow_to_the_cap() {
        let settings = BackoffSettings {
            jitter: 0.0,
            ..BackoffSettings::default()
        };
        let mut backoff = seeded(settings);
        let delays: Vec<Duration> = (0..16).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[2], Duration::from_millis(1_500));
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(*delays.last().unwrap(), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn extreme_factors_stay_within_bounds() {
        for factor in [f64::INFINITY, f64::MAX, f64::NAN] {
            let mut backoff = seeded(BackoffSettings {
                factor,
                jitter: 1.0,
                ..BackoffSettings::default()
            });
            for _ in 0..4 {
                assert!(backoff.next_delay() <= DEFAULT_MAX_DELAY * 2);
            }
        }

        let mut backoff = seeded(BackoffSettings {
            factor: f64::INFINITY,
            jitter: 0.0,
            ..BackoffSettings::default()
        });
        let delays: Vec<Duration> = (0..3).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays, vec![Duration::ZERO, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY]);
    }

    #[test]
    fn reset_restarts_the_curve() {
        let mut backoff = seeded(BackoffSettings::default());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::ZERO);

        backoff.reset_to_max();
        assert!(backoff.next_delay() >= DEFAULT_MAX_DELAY / 2);
    }
}
