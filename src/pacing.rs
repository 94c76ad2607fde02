//! Adaptive pacing for the consumer loop.
//!
//! The consumer dequeues at most one pending record per tick and sleeps the
//! controller's current delay between ticks. [`PacingController`] keeps the
//! observed inter-tick interval near a requested target: after each tick it
//! compares the measured interval against the target plus a tolerance band,
//! shrinking the delay when ticks run slow and growing it when they run
//! fast. A zero target disables pacing entirely and the loop drains the
//! queue as fast as it can.
//!
//! Arithmetic is done on signed nanoseconds so an overshoot correction can
//! drive the working delay through zero; the exposed delay is clamped to
//! non-negative.

use std::time::Duration;

// ---------------------------------------------------------------------------
// PacingController
// ---------------------------------------------------------------------------

/// Feedback controller for the inter-tick delay.
///
/// Owned by the consumer loop; never shared. Retargeting resets the working
/// delay to the new target so convergence restarts from a clean slate.
#[derive(Debug)]
pub(crate) struct PacingController {
    /// Requested inter-tick interval, nanoseconds.
    target: i64,
    /// Half-width of the dead band around the target, nanoseconds.
    tolerance: i64,
    /// Current working delay, nanoseconds. May be driven to zero but never
    /// below it.
    delay: i64,
}

impl PacingController {
    pub(crate) fn new(target: Duration, tolerance: Duration) -> Self {
        let target = as_nanos(target);
        Self {
            target,
            tolerance: as_nanos(tolerance),
            delay: target,
        }
    }

    /// Current sleep to apply before the next tick.
    #[must_use]
    pub(crate) fn delay(&self) -> Duration {
        // delay is clamped non-negative on every write
        Duration::from_nanos(self.delay.unsigned_abs())
    }

    #[must_use]
    pub(crate) fn target(&self) -> Duration {
        Duration::from_nanos(self.target.unsigned_abs())
    }

    /// Adopts a new target and restarts convergence from it.
    pub(crate) fn retarget(&mut self, target: Duration) {
        self.target = as_nanos(target);
        self.delay = self.target;
    }

    /// Feeds back one measured inter-tick interval.
    ///
    /// Intervals inside `target ± tolerance` leave the delay alone. A slow
    /// tick shrinks the delay by the overshoot; a fast tick grows it by the
    /// shortfall.
    pub(crate) fn observe(&mut self, interval: Duration) {
        if self.target == 0 {
            self.delay = 0;
            return;
        }
        let interval = as_nanos(interval);
        if interval > self.target + self.tolerance {
            self.delay -= interval - self.target;
        } else if interval < self.target - self.tolerance {
            self.delay += self.target - interval;
        }
        self.delay = self.delay.max(0);
    }
}

fn as_nanos(d: Duration) -> i64 {
    // Saturate rather than wrap for absurd inputs (> ~292 years).
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn controller() -> PacingController {
        PacingController::new(Duration::from_millis(10), MS)
    }

    #[test]
    fn test_pacing_starts_at_target() {
        let pacing = controller();
        assert_eq!(pacing.delay(), Duration::from_millis(10));
        assert_eq!(pacing.target(), Duration::from_millis(10));
    }

    #[test]
    fn test_pacing_dead_band_leaves_delay_alone() {
        let mut pacing = controller();
        pacing.observe(Duration::from_millis(10));
        pacing.observe(Duration::from_micros(10_500));
        pacing.observe(Duration::from_micros(9_500));
        assert_eq!(pacing.delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_pacing_slow_tick_shrinks_delay() {
        let mut pacing = controller();
        // 4ms over target: delay drops by the overshoot.
        pacing.observe(Duration::from_millis(14));
        assert_eq!(pacing.delay(), Duration::from_millis(6));
    }

    #[test]
    fn test_pacing_fast_tick_grows_delay() {
        let mut pacing = controller();
        pacing.observe(Duration::from_millis(3));
        assert_eq!(pacing.delay(), Duration::from_millis(17));
    }

    #[test]
    fn test_pacing_delay_never_negative() {
        let mut pacing = controller();
        pacing.observe(Duration::from_millis(100));
        assert_eq!(pacing.delay(), Duration::ZERO);
        // Subsequent fast ticks can bring it back up.
        pacing.observe(Duration::from_millis(2));
        assert_eq!(pacing.delay(), Duration::from_millis(8));
    }

    #[test]
    fn test_pacing_zero_target_disables() {
        let mut pacing = PacingController::new(Duration::ZERO, MS);
        assert_eq!(pacing.delay(), Duration::ZERO);
        pacing.observe(Duration::from_millis(50));
        assert_eq!(pacing.delay(), Duration::ZERO);
    }

    #[test]
    fn test_pacing_retarget_resets_delay() {
        let mut pacing = controller();
        pacing.observe(Duration::from_millis(14));
        assert_eq!(pacing.delay(), Duration::from_millis(6));
        pacing.retarget(Duration::from_millis(20));
        assert_eq!(pacing.delay(), Duration::from_millis(20));
        assert_eq!(pacing.target(), Duration::from_millis(20));
    }

    #[test]
    fn test_pacing_converges_on_constant_overhead() {
        // Each tick costs a fixed 3ms of work on top of the applied delay;
        // the controller should settle so delay + work ≈ target.
        let work = Duration::from_millis(3);
        let mut pacing = controller();
        for _ in 0..50 {
            pacing.observe(pacing.delay() + work);
        }
        let settled = pacing.delay();
        assert!(settled >= Duration::from_millis(6), "settled {settled:?}");
        assert!(settled <= Duration::from_millis(8), "settled {settled:?}");
    }
}
