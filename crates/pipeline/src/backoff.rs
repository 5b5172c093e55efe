//! Exponential backoff between retry attempts.

use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(10);

/// Delay before the given attempt (2-based: the first retry waits the base).
#[must_use]
pub fn delay_before_attempt(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(2).min(16);
    let delay = BASE_DELAY.saturating_mul(2u32.saturating_pow(exponent));
    delay.min(MAX_DELAY)
}
