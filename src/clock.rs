//! Monotonic millisecond clock with wraparound-safe arithmetic.
//!
//! Tick values are 32-bit and roll over. Ordering decisions must always go
//! through [`ticks_diff`], never through a plain comparison of two ticks.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::types::MAX_COUNTDOWN_MS;

/// Signed difference `a - b` computed modulo 2^32.
///
/// Positive when `a` is later than `b`, valid as long as the two ticks are
/// less than 2^31 ms apart.
pub fn ticks_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Adds a signed millisecond offset to a tick value, wrapping.
pub fn ticks_add(ticks: u32, delta_ms: i32) -> u32 {
    ticks.wrapping_add(delta_ms as u32)
}

/// Tick `delay_ms` after `ticks`, with the delay clamped to
/// [`MAX_COUNTDOWN_MS`] so the result still orders after `ticks`.
pub fn ticks_after(ticks: u32, delay_ms: u32) -> u32 {
    ticks.wrapping_add(delay_ms.min(MAX_COUNTDOWN_MS))
}

/// Source of monotonic time for a node.
pub trait Clock {
    /// Current tick count in milliseconds.
    fn now_ms(&self) -> u32;

    /// Blocks the control loop for `ms` milliseconds.
    fn sleep_ms(&self, ms: u32);

    /// Sleeps until `target` is reached. Returns immediately if it already has.
    fn sleep_until(&self, target: u32) {
        let remaining = ticks_diff(target, self.now_ms());
        if remaining > 0 {
            self.sleep_ms(remaining as u32);
        }
    }
}

/// Wall-clock backed monotonic clock.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u32 {
        // Truncation to 32 bits is the rollover.
        self.origin.elapsed().as_millis() as u32
    }

    fn sleep_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}

/// Manually advanced clock.
///
/// Clones share the same tick counter, so every simulated node and the
/// simulated medium observe one timeline. Sleeping advances time instantly.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    ticks: Rc<Cell<u32>>,
}

impl ManualClock {
    /// Creates a clock starting at `start` ticks.
    pub fn starting_at(start: u32) -> Self {
        Self {
            ticks: Rc::new(Cell::new(start)),
        }
    }

    /// Moves the shared timeline forward.
    pub fn advance(&self, ms: u32) {
        self.ticks.set(self.ticks.get().wrapping_add(ms));
    }

    /// Jumps the shared timeline to an absolute tick value.
    pub fn set(&self, ticks: u32) {
        self.ticks.set(ticks);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.ticks.get()
    }

    fn sleep_ms(&self, ms: u32) {
        self.advance(ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_diff_across_rollover() {
        let before = u32::MAX - 10;
        let after = 20u32;
        assert_eq!(ticks_diff(after, before), 31);
        assert_eq!(ticks_diff(before, after), -31);
    }

    #[test]
    fn test_ticks_add_wraps() {
        assert_eq!(ticks_add(u32::MAX, 1), 0);
        assert_eq!(ticks_add(5, -10), u32::MAX - 4);
    }

    #[test]
    fn test_ticks_after_stays_in_the_future() {
        assert_eq!(ticks_after(u32::MAX, 2), 1);
        let far = ticks_after(1_000, 4_000_000_000);
        assert_eq!(far, 1_000u32.wrapping_add(MAX_COUNTDOWN_MS));
        assert!(ticks_diff(far, 1_000) > 0);
    }

    #[test]
    fn test_manual_clock_is_shared() {
        let clock = ManualClock::starting_at(100);
        let other = clock.clone();
        other.advance(50);
        assert_eq!(clock.now_ms(), 150);
        clock.sleep_until(140);
        assert_eq!(clock.now_ms(), 150);
        clock.sleep_until(400);
        assert_eq!(other.now_ms(), 400);
    }
}
