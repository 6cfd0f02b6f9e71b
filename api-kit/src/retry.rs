//! Exponential backoff with random jitter.

use std::time::Duration;

use rand::Rng as _;

/// Caps the exponent so the base delay cannot overflow; 2^16 seconds is
/// already far beyond any sensible retry horizon.
const MAX_SHIFT: u32 = 16;

/// The delay policy applied between retry attempts.
///
/// The delay for attempt `n` (1-based) is `base * 2^n` plus a uniformly
/// random jitter drawn from `[jitter_floor, jitter_ceiling)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    jitter_floor: Duration,
    jitter_ceiling: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: Duration::from_secs(1),
            jitter_floor: Duration::from_millis(10),
            jitter_ceiling: Duration::from_millis(1000),
        }
    }
}

impl Backoff {
    /// Create a backoff policy with a custom base delay and jitter window.
    ///
    /// # Panics
    ///
    /// Panics when the jitter window is empty.
    pub fn new(base: Duration, jitter_floor: Duration, jitter_ceiling: Duration) -> Self {
        assert!(
            jitter_floor < jitter_ceiling,
            "backoff jitter window must be non-empty"
        );
        Backoff {
            base,
            jitter_floor,
            jitter_ceiling,
        }
    }

    /// The delay to sleep before retry attempt `n` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_SHIFT);
        let base = self.base.saturating_mul(1u32 << exponent);

        let floor = self.jitter_floor.as_millis() as u64;
        let ceiling = self.jitter_ceiling.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(floor..ceiling);

        base + Duration::from_millis(jitter)
    }
}
