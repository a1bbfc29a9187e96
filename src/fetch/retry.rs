//! Retry delay computation: `Retry-After` clamp, else exponential
//! backoff, plus uniform jitter.

use rand::Rng;

use crate::config::RetryConfig;
use crate::errors::FetchErrorKind;

/// If the origin sent a `Retry-After`, it is clamped into `[base_delay_ms, max_delay_ms]`
/// rather than trusted verbatim (a misbehaving origin should not be able to stall a host
/// indefinitely or force a busy-loop). Otherwise the delay is
/// `base_delay_ms * 2^attempt * kind.delay_multiplier`, clamped at `max_delay_ms`, with
/// uniform jitter in `[0, delay * jitter_ratio]` added on top.
#[must_use]
pub fn compute_delay_ms(
    attempt: u32,
    kind: FetchErrorKind,
    retry_after_ms: Option<u64>,
    retry: &RetryConfig,
) -> u64 {
    let base = if let Some(retry_after) = retry_after_ms {
        retry_after.clamp(retry.base_delay_ms, retry.max_delay_ms)
    } else {
        let exp = retry.base_delay_ms as f64
            * 2f64.powi(attempt as i32)
            * kind.delay_multiplier();
        (exp as u64).min(retry.max_delay_ms)
    };

    let jitter_span = (base as f64 * retry.jitter_ratio) as u64;
    if jitter_span == 0 {
        base
    } else {
        base + rand::thread_rng().gen_range(0..=jitter_span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_ratio: 0.2,
        }
    }

    #[test]
    fn retry_after_is_clamped_into_base_max_range() {
        let d = compute_delay_ms(0, FetchErrorKind::ServerRetryable, Some(1), &config());
        assert!(d >= 500);

        let d = compute_delay_ms(0, FetchErrorKind::ServerRetryable, Some(999_999), &config());
        assert!(d <= 30_000 + (30_000f64 * 0.2) as u64);
    }

    #[test]
    fn exponential_backoff_grows_with_attempt() {
        let cfg = config();
        let d0 = compute_delay_ms(0, FetchErrorKind::TransientNetwork, None, &cfg);
        let d1 = compute_delay_ms(1, FetchErrorKind::TransientNetwork, None, &cfg);
        let d2 = compute_delay_ms(2, FetchErrorKind::TransientNetwork, None, &cfg);
        assert!(d0 < d1 || d0 == 500 && d1 >= 1000);
        assert!(d1 <= d2 + (d2 as f64 * 0.2) as u64);
    }

    #[test]
    fn delay_never_exceeds_max_plus_jitter() {
        let cfg = config();
        let d = compute_delay_ms(10, FetchErrorKind::ServerRetryable, None, &cfg);
        assert!(d <= cfg.max_delay_ms + (cfg.max_delay_ms as f64 * cfg.jitter_ratio) as u64);
    }
}
