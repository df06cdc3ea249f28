//! Reconnect backoff policy.
//!
//! Pure delay arithmetic for the reconnect scheduler: exponential growth from
//! a base delay up to a cap, with a bounded random jitter applied on top so
//! that a fleet of clients does not reconnect in lockstep after a gateway
//! restart.

use std::time::Duration;

// ----------------------------------------------------------------------------
// Retry Policy
// ----------------------------------------------------------------------------

/// Configuration for reconnect delay growth.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first reconnect attempt
    pub base_delay: Duration,
    /// Upper bound on the un-jittered delay
    pub max_delay: Duration,
    /// Growth factor applied per failed attempt
    pub multiplier: f64,
    /// Maximum jitter as a fraction of the computed delay (0.3 = up to +30%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay for the given attempt number (0 for the first retry).
    ///
    /// Grows as `base * multiplier^attempt`, clamped to `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        // powi saturates to +inf for large exponents, which the min() below
        // collapses back to the cap rather than overflowing.
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw_ms = base_ms * self.multiplier.powi(exponent);
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Delay for the given attempt with jitter applied.
    ///
    /// `fraction` must come from a uniform draw in `[0, 1)`; the result is the
    /// un-jittered delay stretched by up to `jitter * 100` percent. Passing the
    /// draw in (rather than sampling here) keeps this computable in tests.
    pub fn jittered_delay(&self, attempt: u32, fraction: f64) -> Duration {
        let fraction = fraction.clamp(0.0, 1.0);
        let base = self.delay(attempt);
        let stretched = base.as_millis() as f64 * (1.0 + self.jitter * fraction);
        Duration::from_millis(stretched as u64)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
