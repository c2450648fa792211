//! Exponential backoff for contention management.
//!
//! Used by the lock-free queue when retrying claim CAS loops and when a
//! consumer drains page pins before reclaiming a page. Backing off
//! exponentially keeps contended retry loops from saturating the bus.

use core::hint;

/// Default spin ceiling.
const DEFAULT_CEILING: u32 = 128;

/// Hard upper bound for any ceiling.
const MAX_CEILING: u32 = 65536;

/// Exponential backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: u32,
    ceiling: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    /// Create a new backoff state with the default ceiling.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: 1,
            ceiling: DEFAULT_CEILING,
        }
    }

    /// Create a new backoff state with a custom ceiling.
    #[inline]
    #[must_use]
    pub const fn with_ceiling(ceiling: u32) -> Self {
        Self {
            current: 1,
            ceiling: if ceiling > MAX_CEILING {
                MAX_CEILING
            } else {
                ceiling
            },
        }
    }

    /// Reset the progression to its initial value.
    #[inline]
    pub fn reset(&mut self) {
        self.current = 1;
    }

    /// Spin for the current number of iterations, then double it up to the
    /// ceiling.
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..self.current {
            hint::spin_loop();
        }

        if self.current < self.ceiling {
            self.current = self.current.saturating_mul(2);
        }
    }

    /// Whether the progression has reached its ceiling.
    #[inline]
    #[must_use]
    pub fn is_maxed(&self) -> bool {
        self.current >= self.ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spin_doubles() {
        let mut b = Backoff::new();
        assert_eq!(b.current, 1);
        b.spin();
        assert_eq!(b.current, 2);
        b.spin();
        assert_eq!(b.current, 4);
    }

    #[test]
    fn test_ceiling_caps() {
        let mut b = Backoff::with_ceiling(4);
        b.spin();
        b.spin();
        b.spin();
        b.spin();
        assert_eq!(b.current, 4);
        assert!(b.is_maxed());
    }

    #[test]
    fn test_reset() {
        let mut b = Backoff::new();
        b.spin();
        b.reset();
        assert_eq!(b.current, 1);
    }

    #[test]
    fn test_max_ceiling_clamped() {
        let b = Backoff::with_ceiling(u32::MAX);
        assert_eq!(b.ceiling, MAX_CEILING);
    }
}
