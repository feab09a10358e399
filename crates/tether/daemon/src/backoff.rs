//! Reconnect delays.
//!
//! The delay for attempt `n` is `first × factor^n` clamped to `max`, with
//! equal jitter applied to the clamped base: half the base plus a random
//! share of the other half. The jittered value never feeds back into the
//! next attempt.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl From<&ReconnectConfig> for Backoff {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            first: Duration::from_millis(config.first_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            factor: config.factor,
            jitter: config.jitter,
        }
    }
}

impl Backoff {
    /// Un-jittered delay for `attempt` (0-indexed).
    pub fn base(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay to wait before `attempt`.
    pub fn next(&self, attempt: u32) -> Duration {
        let base = self.base(attempt);
        if !self.jitter {
            return base;
        }

        let ms = base.as_millis() as u64;
        let half = ms / 2;
        let extra = if half == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=half)
        };
        Duration::from_millis(half + extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> Backoff {
        Backoff {
            first: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_growth() {
        let backoff = fixed();
        assert_eq!(backoff.next(0), Duration::from_millis(100));
        assert_eq!(backoff.next(1), Duration::from_millis(200));
        assert_eq!(backoff.next(3), Duration::from_millis(800));
    }

    #[test]
    fn test_clamps_to_max() {
        let backoff = fixed();
        assert_eq!(backoff.next(10), Duration::from_secs(5));
        assert_eq!(backoff.next(u32::MAX), Duration::from_secs(5));

        let inverted = Backoff {
            first: Duration::from_secs(10),
            ..fixed()
        };
        assert_eq!(inverted.next(0), Duration::from_secs(5));
    }

    #[test]
    fn test_equal_jitter_bounds() {
        let backoff = Backoff {
            jitter: true,
            ..fixed()
        };
        for attempt in 0..12 {
            let base = backoff.base(attempt);
            let delay = backoff.next(attempt);
            assert!(delay >= base / 2, "attempt {}: {:?} < half of {:?}", attempt, delay, base);
            assert!(delay <= base, "attempt {}: {:?} > {:?}", attempt, delay, base);
        }
    }
}
