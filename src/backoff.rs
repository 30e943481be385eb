//! Retry delay computation.
//!
//! The raw delay is `base × f(curve, attempt)` where `base` comes from the
//! policy (or its per-error-kind override), capped at `max_delay`. Jittered
//! curves then scale by uniform `[0.5, 1.5]` to avoid thundering herds on
//! shared rate limits.

use std::time::Duration;

use crate::config::{Backoff, RetryPolicy};
use crate::error::ErrorKind;

/// A computed delay, reporting whether the cap was hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffDelay {
    pub delay: Duration,
    /// True when the uncapped delay exceeded `max_delay`.
    pub capped: bool,
}

/// Compute the delay before retry number `attempt` (1-indexed) for an error
/// of the given kind.
pub fn delay_for(policy: &RetryPolicy, kind: ErrorKind, attempt: u32) -> BackoffDelay {
    let base = policy
        .error_type_delays
        .get(&kind)
        .copied()
        .unwrap_or(policy.base_delay)
        .as_secs_f64();

    let growth = attempt.saturating_sub(1);
    let raw = match policy.backoff {
        Backoff::Fixed | Backoff::FixedJitter => base,
        Backoff::Linear => base * attempt.max(1) as f64,
        Backoff::Exponential => base * 2f64.powi(growth.min(62) as i32),
    };

    let max = policy.max_delay.as_secs_f64();
    let capped = raw > max;
    let mut delay = raw.min(max);

    if matches!(policy.backoff, Backoff::FixedJitter) {
        delay *= 0.5 + fastrand::f64();
    }

    BackoffDelay {
        delay: Duration::from_secs_f64(delay),
        capped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn policy(backoff: Backoff, base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            attempts: 5,
            retry_on: Vec::new(),
            backoff,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            error_type_delays: HashMap::new(),
        }
    }

    #[test]
    fn test_fixed_is_constant() {
        let p = policy(Backoff::Fixed, 1000, 60_000);
        for attempt in 1..5 {
            let d = delay_for(&p, ErrorKind::NetworkError, attempt);
            assert_eq!(d.delay, Duration::from_secs(1));
            assert!(!d.capped);
        }
    }

    #[test]
    fn test_linear_grows_with_attempt() {
        let p = policy(Backoff::Linear, 1000, 60_000);
        assert_eq!(
            delay_for(&p, ErrorKind::NetworkError, 1).delay,
            Duration::from_secs(1)
        );
        assert_eq!(
            delay_for(&p, ErrorKind::NetworkError, 2).delay,
            Duration::from_secs(2)
        );
        assert_eq!(
            delay_for(&p, ErrorKind::NetworkError, 3).delay,
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_exponential_doubles() {
        let p = policy(Backoff::Exponential, 1000, 60_000);
        assert_eq!(
            delay_for(&p, ErrorKind::NetworkError, 1).delay,
            Duration::from_secs(1)
        );
        assert_eq!(
            delay_for(&p, ErrorKind::NetworkError, 2).delay,
            Duration::from_secs(2)
        );
        assert_eq!(
            delay_for(&p, ErrorKind::NetworkError, 4).delay,
            Duration::from_secs(8)
        );
    }

    #[test]
    fn test_cap_reported() {
        let p = policy(Backoff::Exponential, 1000, 5000);
        let d = delay_for(&p, ErrorKind::NetworkError, 4);
        assert_eq!(d.delay, Duration::from_secs(5));
        assert!(d.capped);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let p = policy(Backoff::FixedJitter, 1000, 60_000);
        for _ in 0..200 {
            let d = delay_for(&p, ErrorKind::NetworkError, 1);
            assert!(d.delay >= Duration::from_millis(500), "{:?}", d.delay);
            assert!(d.delay <= Duration::from_millis(1500), "{:?}", d.delay);
        }
    }

    #[test]
    fn test_error_type_override() {
        let mut p = policy(Backoff::Fixed, 1000, 60_000);
        p.error_type_delays
            .insert(ErrorKind::RateLimit, Duration::from_secs(10));

        let rate_limited = delay_for(&p, ErrorKind::RateLimit, 1);
        let network = delay_for(&p, ErrorKind::NetworkError, 1);
        assert_eq!(rate_limited.delay, Duration::from_secs(10));
        assert_eq!(network.delay, Duration::from_secs(1));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let p = policy(Backoff::Exponential, 1000, 30_000);
        let d = delay_for(&p, ErrorKind::NetworkError, u32::MAX);
        assert_eq!(d.delay, Duration::from_secs(30));
        assert!(d.capped);
    }
}
