//! Exponential backoff with symmetric jitter.

use rand::Rng;
use std::time::Duration;

/// Default jitter factor range.
pub const DEFAULT_JITTER: (f64, f64) = (0.5, 1.5);

/// Un-jittered delay before retry number `attempt` (0-based), capped at `max`.
pub fn exponential_delay(attempt: u32, base: Duration, max: Duration, exponential: bool) -> Duration {
    if !exponential {
        return base.min(max);
    }
    let factor = 2u32.saturating_pow(attempt);
    base.saturating_mul(factor).min(max)
}

/// Scale `delay` by a random factor drawn from `range`, capped at `max`.
pub fn apply_jitter(delay: Duration, range: (f64, f64), max: Duration) -> Duration {
    let (low, high) = range;
    let factor = if high > low {
        rand::thread_rng().gen_range(low..=high)
    } else {
        low
    };
    delay.mul_f64(factor.max(0.0)).min(max)
}

/// Jittered exponential delay before retry number `attempt`.
pub fn calculate_backoff(
    attempt: u32,
    base: Duration,
    max: Duration,
    exponential: bool,
    jitter: (f64, f64),
) -> Duration {
    apply_jitter(exponential_delay(attempt, base, max, exponential), jitter, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(2);

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(exponential_delay(0, BASE, MAX, true), Duration::from_millis(100));
        assert_eq!(exponential_delay(1, BASE, MAX, true), Duration::from_millis(200));
        assert_eq!(exponential_delay(3, BASE, MAX, true), Duration::from_millis(800));
        assert_eq!(exponential_delay(10, BASE, MAX, true), MAX);
        assert_eq!(exponential_delay(4, BASE, MAX, false), BASE);
    }

    #[test]
    fn jitter_stays_in_range() {
        for attempt in 0..4 {
            let raw = exponential_delay(attempt, BASE, MAX, true);
            for _ in 0..50 {
                let d = calculate_backoff(attempt, BASE, MAX, true, DEFAULT_JITTER);
                assert!(d >= raw.mul_f64(0.5));
                assert!(d <= raw.mul_f64(1.5));
            }
        }
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        for _ in 0..50 {
            assert!(calculate_backoff(20, BASE, MAX, true, DEFAULT_JITTER) <= MAX);
        }
    }

    #[test]
    fn fixed_factor_is_exact() {
        assert_eq!(apply_jitter(BASE, (1.0, 1.0), MAX), BASE);
    }
}
