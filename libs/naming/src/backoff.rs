//! Exponential backoff with jitter for recovery attempts

use rand::Rng;
use std::time::Duration;

use crate::config::RecoveryConfig;

/// Upper bound for any computed delay; anything longer is a misconfiguration.
const MAX_BACKOFF_SECS: f64 = 3600.0;

/// Delay before retrying after the `attempt`-th failure (0-based).
///
/// `initial * multiplier^attempt`, capped at `max_backoff`, plus up to 25%
/// jitter when enabled. Non-finite or negative settings are sanitized
/// instead of panicking.
#[must_use]
pub fn delay_for(cfg: &RecoveryConfig, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);

    let multiplier = if cfg.multiplier.is_finite() && cfg.multiplier >= 0.0 {
        cfg.multiplier
    } else {
        1.0
    };

    let initial_secs = cfg.initial_backoff.as_secs_f64();
    let max_secs = cfg.max_backoff.as_secs_f64().min(MAX_BACKOFF_SECS);

    let raw = initial_secs * multiplier.powi(exponent);
    let clamped = if raw.is_finite() {
        raw.min(max_secs).max(0.0)
    } else {
        max_secs
    };
    let delay = Duration::from_secs_f64(clamped);

    let delay = if cfg.jitter {
        let factor = rand::rng().random_range(0.0..=0.25);
        delay + delay.mul_f64(factor)
    } else {
        delay
    };

    delay.min(Duration::from_secs_f64(max_secs))
}
