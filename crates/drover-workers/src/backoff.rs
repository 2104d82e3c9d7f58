//! Retry backoff computation
//!
//! Exponential with a hard ceiling and a jitter fraction so that a batch of
//! tasks failed by the same outage does not re-arrive in lockstep.

use drover_core::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Apply a jitter fraction to a millisecond duration
///
/// `jitter = 0.2` yields a value uniformly in `[0.8 * ms, 1.2 * ms]`.
pub fn jittered_ms(ms: u64, jitter: f64) -> u64 {
    if jitter <= 0.0 || ms == 0 {
        return ms;
    }
    let jitter = jitter.min(1.0);
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    (ms as f64 * factor).round().max(0.0) as u64
}

/// Backoff delay before retry attempt `attempt` (1-based)
pub fn retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let shift = (attempt - 1).min(16);
    let raw = config
        .base_delay_ms
        .saturating_mul(1u64 << shift)
        .min(config.max_delay_ms);
    Duration::from_millis(jittered_ms(raw, config.jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter,
        }
    }

    #[test]
    fn test_exponential_growth() {
        let c = config(0.0);
        assert_eq!(retry_delay(&c, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(&c, 2), Duration::from_millis(200));
        assert_eq!(retry_delay(&c, 3), Duration::from_millis(400));
    }

    #[test]
    fn test_ceiling() {
        let c = config(0.0);
        assert_eq!(retry_delay(&c, 5), Duration::from_millis(1_000));
        assert_eq!(retry_delay(&c, 30), Duration::from_millis(1_000));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let c = config(0.0);
        assert_eq!(retry_delay(&c, 0), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_bounds() {
        let c = config(0.5);
        for _ in 0..100 {
            let d = retry_delay(&c, 1).as_millis() as u64;
            assert!((50..=150).contains(&d), "jittered delay {} out of bounds", d);
        }
    }

    #[test]
    fn test_jittered_ms_zero() {
        assert_eq!(jittered_ms(0, 0.5), 0);
        assert_eq!(jittered_ms(100, 0.0), 100);
    }
}
