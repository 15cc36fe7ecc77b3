//! Ring scheduler: periodic RING/+CLIP cadence while an inbound call is pending (§4.I).
//!
//! Only one ring timer exists globally (it is armed by an incoming-call indication, not
//! per-peer), mirroring the single `g_timeout_add` the original reference AG used for the
//! RING loop.

use tokio::time::{Duration, Instant};

/// Cadence between successive RING emissions.
pub const INTERVAL: Duration = Duration::from_secs(3);

/// Tracks whether the ring cadence is active and when its next tick is due.
#[derive(Debug, Default)]
pub struct RingScheduler {
    next_deadline: Option<Instant>,
}

impl RingScheduler {
    /// Creates a disarmed scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the cadence is currently active.
    pub fn is_armed(&self) -> bool {
        self.next_deadline.is_some()
    }

    /// Arms the cadence, firing immediately (per §4.I: "emit one RING+CLIP immediately").
    ///
    /// A no-op, logged at debug level by the caller, if already armed (§4.I: "attempts to
    /// arm it while active are no-ops").
    pub fn arm(&mut self, now: Instant) -> bool {
        if self.next_deadline.is_some() {
            return false;
        }
        self.next_deadline = Some(now);
        true
    }

    /// Disarms the cadence (CancelCall, ATA, AT+CHUP, or call-stopped indication).
    pub fn disarm(&mut self) {
        self.next_deadline = None;
    }

    /// The deadline the caller's `tokio::select!` should wait on, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.next_deadline
    }

    /// Advances the schedule past a fired tick, returning the next deadline.
    ///
    /// Must only be called when [`Self::deadline`] has actually elapsed; the caller emits
    /// one RING(+CLIP) per call to this.
    pub fn advance(&mut self) -> Option<Instant> {
        if let Some(prev) = self.next_deadline {
            let next = prev + INTERVAL;
            self.next_deadline = Some(next);
            Some(next)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn arm_fires_immediately_then_every_three_seconds() {
        let mut sched = RingScheduler::new();
        let start = Instant::now();
        assert!(sched.arm(start));
        assert_eq!(sched.deadline(), Some(start));

        let next = sched.advance().unwrap();
        assert_eq!(next, start + INTERVAL);
    }

    #[test]
    fn re_arming_while_active_is_a_no_op() {
        let mut sched = RingScheduler::new();
        let now = Instant::now();
        assert!(sched.arm(now));
        assert!(!sched.arm(now));
    }

    #[test]
    fn disarm_clears_deadline() {
        let mut sched = RingScheduler::new();
        sched.arm(Instant::now());
        sched.disarm();
        assert!(!sched.is_armed());
        assert_eq!(sched.advance(), None);
    }
}
