//! Reconnect backoff policy for [`super::ChannelConnection`].

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with symmetric jitter.
///
/// The delay before retry `n` (1-based) is `min(cap, base * 2^(n-1))`,
/// scaled by a random factor in `[1 - jitter, 1 + jitter]` and clamped to
/// `cap` again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound for any delay.
    pub cap: Duration,
    /// Jitter fraction in `[0.0, 1.0]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay for `attempt` before jitter. Attempt `0` has no delay.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// Delay for `attempt` with an explicit jitter `factor`.
    ///
    /// The factor is clamped to the policy's jitter band.
    #[must_use]
    pub fn delay_with_factor(&self, attempt: u32, factor: f64) -> Duration {
        let jitter = self.jitter_band();
        let factor = if factor.is_nan() {
            1.0
        } else {
            factor.clamp(1.0 - jitter, 1.0 + jitter)
        };
        let scaled = self.base_delay(attempt).as_secs_f64() * factor;
        Duration::try_from_secs_f64(scaled).map_or(self.cap, |d| d.min(self.cap))
    }

    /// Delay for `attempt` with random jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = self.jitter_band();
        let factor = if jitter > 0.0 {
            rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        self.delay_with_factor(attempt, factor)
    }

    /// Jitter clamped to `[0.0, 1.0]`; NaN counts as no jitter.
    fn jitter_band(&self) -> f64 {
        if self.jitter.is_nan() {
            0.0
        } else {
            self.jitter.clamp(0.0, 1.0)
        }
    }
}
