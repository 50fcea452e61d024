//! Exponential backoff with jitter for reconnect scheduling.

use rand::Rng;
use std::time::Duration;

/// Delay before reconnect attempt `attempt` (1-based).
///
/// Attempt 0 is immediate. The exponential part is capped at `max_ms`
/// before up to 10% jitter is added on top.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 || base_ms == 0 {
        return Duration::ZERO;
    }

    let factor = 2u64.saturating_pow(attempt - 1);
    let capped = base_ms.saturating_mul(factor).min(max_ms.max(base_ms));

    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_uses_base_delay() {
        let delay = calculate_backoff(1, 100, 2000).as_millis();
        assert!((100..110).contains(&delay));
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let delay = calculate_backoff(3, 100, 2000).as_millis();
        assert!((400..440).contains(&delay));
    }

    #[test]
    fn delay_is_capped() {
        let delay = calculate_backoff(30, 100, 1000).as_millis();
        assert!((1000..1100).contains(&delay));
    }

    #[test]
    fn zero_base_or_attempt_is_immediate() {
        assert_eq!(calculate_backoff(0, 100, 1000), Duration::ZERO);
        assert_eq!(calculate_backoff(4, 0, 1000), Duration::ZERO);
    }

    #[test]
    fn cap_below_base_keeps_base() {
        let delay = calculate_backoff(2, 500, 100).as_millis();
        assert!((500..550).contains(&delay));
    }
}
