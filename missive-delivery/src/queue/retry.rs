//! Exponential backoff

use std::time::Duration;

/// Delay before the next attempt after `attempts` failed ones
///
/// `delay = min(base * 2^(attempts - 1), max)`, and zero when nothing has
/// been attempted yet. Non-decreasing in `attempts`.
#[must_use]
pub const fn calculate_backoff(attempts: u32, base_delay_secs: u64, max_delay_secs: u64) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }

    let exponent = attempts - 1;
    let delay = if exponent >= 63 {
        max_delay_secs
    } else {
        let multiplier = 1u64 << exponent;
        let delay = base_delay_secs.saturating_mul(multiplier);
        if delay < max_delay_secs {
            delay
        } else {
            max_delay_secs
        }
    };

    Duration::from_secs(delay)
}
