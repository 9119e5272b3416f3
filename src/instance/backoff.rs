//! Exponential backoff with jitter.
//!
//! Used for port-bind retries, the startup retry loop, and transient
//! network failures on the long-poll connection.

use std::time::Duration;

use rand::Rng;

/// Backoff policy: `base * multiplier^attempt`, capped at `max`, plus
/// additive jitter of up to `jitter_factor * delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    /// Jitter factor (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Backoff {
    /// Port-bind retries: doubling from one second, capped at 60s.
    pub const PORT_BIND: Backoff = Backoff {
        base: Duration::from_secs(1),
        multiplier: 2.0,
        max: Duration::from_secs(60),
        jitter_factor: 0.25,
    };

    /// Startup retries after a conflict: 30s growing by 1.5x, capped at 180s.
    pub const STARTUP: Backoff = Backoff {
        base: Duration::from_secs(30),
        multiplier: 1.5,
        max: Duration::from_secs(180),
        jitter_factor: 0.2,
    };

    /// Transient network failures: 25 to 30 seconds.
    pub const NETWORK: Backoff = Backoff {
        base: Duration::from_secs(25),
        multiplier: 1.0,
        max: Duration::from_secs(25),
        jitter_factor: 0.2,
    };

    /// A policy that never waits. Handy in tests.
    pub const NONE: Backoff = Backoff {
        base: Duration::ZERO,
        multiplier: 1.0,
        max: Duration::ZERO,
        jitter_factor: 0.0,
    };

    /// Delay before retry number `attempt` (0-based) without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Delay before retry number `attempt` (0-based) with jitter applied.
    ///
    /// Jitter is added on top of the capped delay, so the result lies in
    /// `[capped, capped * (1 + jitter_factor)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.base_delay(attempt);
        let jitter_range = (capped.as_millis() as f64 * self.jitter_factor.clamp(0.0, 1.0)) as u64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range)
        } else {
            0
        };
        capped + Duration::from_millis(jitter)
    }
}
