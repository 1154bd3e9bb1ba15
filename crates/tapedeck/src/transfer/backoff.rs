//! Retry delay policy.

use std::time::Duration;

/// Largest exponent applied; keeps the multiplication in range.
const MAX_DOUBLINGS: u32 = 20;

/// Delay before the next attempt after `attempts` failures:
/// `base * 2^(attempts - 1)`. Zero failures means no delay.
pub fn retry_delay(base: Duration, attempts: u32) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }
    let doublings = (attempts - 1).min(MAX_DOUBLINGS);
    base.saturating_mul(1u32 << doublings)
}
