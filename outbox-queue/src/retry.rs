//! Retry logic with exponential backoff

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::config::RetryConfig;

/// Delay before the next attempt, in seconds
///
/// # Formula
/// `delay = min(base * 2^(attempt - 1), max_delay) * (1 ± jitter)`
///
/// `attempt` is 1-indexed: the number of attempts made so far.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn backoff_secs(attempt: u32, config: &RetryConfig) -> u64 {
    let exponent = attempt.saturating_sub(1);
    let delay = if exponent >= 63 {
        config.max_delay_secs
    } else {
        config
            .base_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(config.max_delay_secs)
    };

    if config.jitter_factor <= 0.0 {
        return delay;
    }

    let jitter_range = (delay as f64) * config.jitter_factor;
    let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
    ((delay as f64) + jitter).max(0.0) as u64
}

/// When a record that has failed `attempt` times may be tried again
pub fn next_retry_at(now: DateTime<Utc>, attempt: u32, config: &RetryConfig) -> DateTime<Utc> {
    let secs = i64::try_from(backoff_secs(attempt, config)).unwrap_or(i64::MAX);
    Duration::try_seconds(secs)
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
