//! Exponential backoff with jitter.

use std::time::Duration;
use rand::Rng;

/// Delay before retry number `retry` (1-based: the delay preceding the
/// second attempt is `retry = 1`).
///
/// `initial * multiplier^(retry - 1)`, capped at `max`. The multiplier is
/// applied as given, so values below 1.0 shrink successive delays; loaded
/// configs reject them in validation. A negative or NaN result yields zero.
pub fn calculate_backoff(retry: u32, initial: Duration, multiplier: f64, max: Duration) -> Duration {
    if retry == 0 {
        return Duration::ZERO;
    }

    let exponent = (retry - 1).min(i32::MAX as u32) as i32;
    let delay_ms = initial.as_millis() as f64 * multiplier.powi(exponent);
    let capped_ms = delay_ms.max(0.0).min(max.as_millis() as f64);
    Duration::from_millis(capped_ms.round() as u64)
}

/// Add a random component in `[0, delay * ratio)` to desynchronize retriers.
pub fn apply_jitter(delay: Duration, ratio: f64) -> Duration {
    let jitter_range = (delay.as_millis() as f64 * ratio.clamp(0.0, 1.0)) as u64;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_millis(2000);

        assert_eq!(calculate_backoff(0, initial, 2.0, max), Duration::ZERO);
        assert_eq!(calculate_backoff(1, initial, 2.0, max), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, initial, 2.0, max), Duration::from_millis(200));
        assert_eq!(calculate_backoff(3, initial, 2.0, max), Duration::from_millis(400));
        assert_eq!(calculate_backoff(10, initial, 2.0, max), max);
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let max = Duration::from_secs(30);
        assert_eq!(calculate_backoff(u32::MAX, Duration::from_secs(1), 10.0, max), max);
    }

    #[test]
    fn test_multiplier_below_one_is_honoured() {
        let initial = Duration::from_millis(400);
        let max = Duration::from_secs(1);
        assert_eq!(calculate_backoff(1, initial, 0.5, max), Duration::from_millis(400));
        assert_eq!(calculate_backoff(2, initial, 0.5, max), Duration::from_millis(200));
        assert_eq!(calculate_backoff(3, initial, 0.5, max), Duration::from_millis(100));
        assert_eq!(calculate_backoff(3, initial, -2.0, max), Duration::from_millis(1000));
        assert_eq!(calculate_backoff(2, initial, -2.0, max), Duration::ZERO);
        assert_eq!(calculate_backoff(2, initial, f64::NAN, max), Duration::ZERO);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = apply_jitter(base, 0.1);
            assert!(d >= base);
            assert!(d < Duration::from_millis(1100));
        }
        assert_eq!(apply_jitter(base, 0.0), base);
    }
}
