//! Quiet-period detection before a finished job's view is swapped.
//!
//! A terminal status can arrive before the last lines of output. Once
//! armed, the detector waits until no merge has been accepted for the
//! threshold, then fires its transition callback exactly once. The
//! "already transitioned" state lives in an explicit
//! [`TransitionGuard`], so a timer tick and a channel close landing in
//! the same turn cannot both fire.

use std::time::Duration;

use tokio::time::Instant;

/// Quiet period used when none is configured.
pub const DEFAULT_QUIESCENCE_THRESHOLD: Duration = Duration::from_millis(3000);

/// One-shot latch.
#[derive(Debug, Default)]
pub struct TransitionGuard {
    fired: bool,
}

impl TransitionGuard {
    /// Returns `true` the first time only.
    pub fn try_fire(&mut self) -> bool {
        if self.fired {
            return false;
        }
        self.fired = true;
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

/// Result of one quiescence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// Not armed yet.
    Idle,
    /// Still inside the quiet window; re-check after the given delay.
    Wait(Duration),
    /// The transition callback ran during this check.
    Fired,
    /// The transition already happened earlier.
    Done,
}

type OnTransition = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct QuiescenceDetector {
    threshold: Duration,
    on_transition: Option<OnTransition>,
    guard: TransitionGuard,
}

impl QuiescenceDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the detector. Call once the store observes a terminal status.
    ///
    /// Arming again, or after the transition fired, is a no-op.
    pub fn arm_transition<F>(&mut self, threshold: Duration, on_transition: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_armed() || self.guard.has_fired() {
            return;
        }
        tracing::debug!(threshold_ms = threshold.as_millis() as u64, "Quiescence armed");
        self.threshold = threshold;
        self.on_transition = Some(Box::new(on_transition));
    }

    pub fn is_armed(&self) -> bool {
        self.on_transition.is_some()
    }

    pub fn has_transitioned(&self) -> bool {
        self.guard.has_fired()
    }

    /// Compare `now` against the last accepted merge and fire once the
    /// quiet period has elapsed.
    pub fn check(&mut self, last_update_at: Option<Instant>, now: Instant) -> Check {
        if self.guard.has_fired() {
            return Check::Done;
        }
        if !self.is_armed() {
            return Check::Idle;
        }

        let elapsed = last_update_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(self.threshold);
        if elapsed < self.threshold {
            return Check::Wait(self.threshold - elapsed);
        }
        self.fire()
    }

    /// When the next check is due, if armed and not yet fired.
    pub fn deadline(&self, last_update_at: Option<Instant>, now: Instant) -> Option<Instant> {
        if !self.is_armed() || self.guard.has_fired() {
            return None;
        }
        Some(match last_update_at {
            Some(t) => t + self.threshold,
            None => now,
        })
    }

    /// Fire immediately, without waiting for the quiet period (e.g. the
    /// push channel closed after the job finished). Only fires if armed.
    pub fn fire_now(&mut self) -> Check {
        if self.guard.has_fired() {
            return Check::Done;
        }
        if !self.is_armed() {
            return Check::Idle;
        }
        self.fire()
    }

    fn fire(&mut self) -> Check {
        if !self.guard.try_fire() {
            return Check::Done;
        }
        tracing::info!("Quiet period reached, requesting transition");
        if let Some(on_transition) = self.on_transition.take() {
            on_transition();
        }
        Check::Fired
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn counting_detector(threshold: Duration) -> (QuiescenceDetector, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let mut detector = QuiescenceDetector::new();
        detector.arm_transition(threshold, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (detector, fired)
    }

    #[test]
    fn guard_fires_once() {
        let mut guard = TransitionGuard::default();
        assert!(guard.try_fire());
        assert!(!guard.try_fire());
        assert!(guard.has_fired());
    }

    #[test]
    fn unarmed_detector_is_idle() {
        let mut detector = QuiescenceDetector::new();
        assert_eq!(detector.check(Some(Instant::now()), Instant::now()), Check::Idle);
        assert_eq!(detector.fire_now(), Check::Idle);
        assert!(detector.deadline(None, Instant::now()).is_none());
    }

    #[test]
    fn waits_for_remaining_quiet_time() {
        let (mut detector, fired) = counting_detector(DEFAULT_QUIESCENCE_THRESHOLD);
        let last = Instant::now();
        let check = detector.check(Some(last), last + Duration::from_millis(1200));
        assert_eq!(check, Check::Wait(Duration::from_millis(1800)));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fires_at_threshold_exactly_once() {
        let (mut detector, fired) = counting_detector(DEFAULT_QUIESCENCE_THRESHOLD);
        let last = Instant::now();
        let at = last + DEFAULT_QUIESCENCE_THRESHOLD;
        assert_eq!(detector.check(Some(last), at), Check::Fired);
        assert_eq!(detector.check(Some(last), at), Check::Done);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timer_and_close_in_same_turn_fire_once() {
        let (mut detector, fired) = counting_detector(DEFAULT_QUIESCENCE_THRESHOLD);
        let last = Instant::now();
        detector.check(Some(last), last + Duration::from_secs(5));
        assert_eq!(detector.fire_now(), Check::Done);

        let (mut detector, second) = counting_detector(DEFAULT_QUIESCENCE_THRESHOLD);
        detector.fire_now();
        assert_eq!(
            detector.check(Some(last), last + Duration::from_secs(5)),
            Check::Done
        );

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rearming_after_fire_is_noop() {
        let (mut detector, fired) = counting_detector(Duration::from_millis(10));
        detector.fire_now();
        let counter = Arc::clone(&fired);
        detector.arm_transition(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!detector.is_armed());
        assert_eq!(detector.fire_now(), Check::Done);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deadline_tracks_last_update() {
        let (detector, _) = counting_detector(Duration::from_secs(3));
        let last = Instant::now();
        assert_eq!(
            detector.deadline(Some(last), last),
            Some(last + Duration::from_secs(3))
        );
    }

    #[test]
    fn never_updated_job_is_already_quiet() {
        let (mut detector, fired) = counting_detector(Duration::from_secs(3));
        assert_eq!(detector.check(None, Instant::now()), Check::Fired);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
