//! Gaze state tracker: debounced on-target signal and dwell timer.

use std::time::Duration;

use tracing::{debug, trace};

use crate::clock::{Clock, MonotonicClock};
use crate::protocol::{GazeSample, SurfaceFrame, INVALID_POSITION};

/// Consecutive differing observations needed to flip the debounced value.
pub const DEFAULT_DEBOUNCE_THRESHOLD: u32 = 5;

/// Boolean filter that only changes after `threshold` consecutive
/// observations disagree with the stable value.
#[derive(Debug, Clone)]
pub struct Debounce {
    stable: bool,
    pending: u32,
    threshold: u32,
}

impl Debounce {
    /// Threshold is clamped to at least 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            stable: false,
            pending: 0,
            threshold: threshold.max(1),
        }
    }

    /// Feed one observation; returns the (possibly updated) stable value.
    pub fn observe(&mut self, value: bool) -> bool {
        if value == self.stable {
            self.pending = 0;
        } else {
            self.pending += 1;
            if self.pending >= self.threshold {
                self.stable = value;
                self.pending = 0;
            }
        }
        self.stable
    }

    pub fn stable(&self) -> bool {
        self.stable
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl Default for Debounce {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_THRESHOLD)
    }
}

/// Tracks the most recent gaze sample, the debounced on-target state and
/// how long it has been on target.
#[derive(Debug)]
pub struct GazeTracker<C: Clock = MonotonicClock> {
    debounce: Debounce,
    latest: Option<GazeSample>,
    gaze_start: Option<Duration>,
    clock: C,
}

impl GazeTracker<MonotonicClock> {
    pub fn new(threshold: u32) -> Self {
        Self::with_clock(threshold, MonotonicClock::new())
    }
}

impl<C: Clock> GazeTracker<C> {
    pub fn with_clock(threshold: u32, clock: C) -> Self {
        Self {
            debounce: Debounce::new(threshold),
            latest: None,
            gaze_start: None,
            clock,
        }
    }

    /// Keep the frame's latest gaze sample. Returns false if the frame had
    /// none or it was not newer than the retained sample.
    pub fn ingest(&mut self, frame: SurfaceFrame) -> bool {
        match frame.into_latest_gaze() {
            Some(sample) => self.ingest_sample(sample),
            None => false,
        }
    }

    /// Accept one sample if its timestamp is finite and strictly newer; each
    /// accepted sample is one debounce observation.
    pub fn ingest_sample(&mut self, sample: GazeSample) -> bool {
        if !sample.timestamp.is_finite() {
            trace!(ts = sample.timestamp, "non-finite gaze timestamp dropped");
            return false;
        }
        if let Some(prev) = &self.latest {
            if sample.timestamp <= prev.timestamp {
                trace!(
                    ts = sample.timestamp,
                    retained = prev.timestamp,
                    "stale gaze sample dropped"
                );
                return false;
            }
        }

        let was = self.debounce.stable();
        let now_on = self.debounce.observe(sample.on_target);
        if now_on != was {
            debug!(on_target = now_on, ts = sample.timestamp, "gaze state changed");
            self.gaze_start = now_on.then(|| self.clock.now());
        }
        self.latest = Some(sample);
        true
    }

    /// Debounced on-target value.
    pub fn is_looking_at_target(&self) -> bool {
        self.debounce.stable()
    }

    /// Time on target so far, zero when off target.
    pub fn dwell(&self) -> Duration {
        match self.gaze_start {
            Some(start) if self.debounce.stable() => self.clock.now().saturating_sub(start),
            _ => Duration::ZERO,
        }
    }

    pub fn dwell_seconds(&self) -> f64 {
        self.dwell().as_secs_f64()
    }

    /// Normalized position of the retained sample, or the sentinel.
    pub fn current_position(&self) -> [f64; 2] {
        self.latest
            .as_ref()
            .map(|s| s.normalized_position)
            .unwrap_or(INVALID_POSITION)
    }

    pub fn latest_sample(&self) -> Option<&GazeSample> {
        self.latest.as_ref()
    }

    pub fn threshold(&self) -> u32 {
        self.debounce.threshold()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn sample(ts: f64, on: bool) -> GazeSample {
        GazeSample {
            topic: "gaze.3d.01._on_surface".into(),
            normalized_position: [0.4, 0.6],
            confidence: 0.95,
            on_target: on,
            base_topic: "gaze.3d.01.".into(),
            base_timestamp: ts,
            timestamp: ts,
        }
    }

    #[test]
    fn debounce_flips_on_threshold() {
        let mut d = Debounce::new(5);
        let input = [false, false, true, true, true, true, true, false];
        let out: Vec<bool> = input.iter().map(|&v| d.observe(v)).collect();
        assert_eq!(out, [false, false, false, false, false, false, true, true]);
    }

    #[test]
    fn debounce_ignores_single_flicker() {
        let mut d = Debounce::new(3);
        for v in [true, true, true] {
            d.observe(v);
        }
        assert!(d.stable());
        for v in [false, true, false, false, true, false, false] {
            assert!(d.observe(v));
        }
        assert!(!d.observe(false));
    }

    #[test]
    fn debounce_threshold_is_at_least_one() {
        let mut d = Debounce::new(0);
        assert_eq!(d.threshold(), 1);
        assert!(d.observe(true));
        assert!(!d.observe(false));
    }

    #[test]
    fn debounce_matches_run_length_rule_on_random_input() {
        let mut rng = StdRng::seed_from_u64(0x6e64_7274);
        for threshold in 1..=7u32 {
            let mut d = Debounce::new(threshold);
            let mut stable = false;
            let mut run = 0u32;
            for _ in 0..2_000 {
                let v = rng.gen_bool(0.5);
                if v == stable {
                    run = 0;
                } else {
                    run += 1;
                }
                let expected_flip = run == threshold;
                let out = d.observe(v);
                assert_eq!(out != stable, expected_flip, "threshold {threshold}");
                if expected_flip {
                    stable = out;
                    run = 0;
                }
            }
        }
    }

    #[test]
    fn defaults_without_samples() {
        let tracker = GazeTracker::with_clock(5, ManualClock::new());
        assert!(!tracker.is_looking_at_target());
        assert_eq!(tracker.dwell_seconds(), 0.0);
        assert_eq!(tracker.current_position(), INVALID_POSITION);
        assert!(tracker.latest_sample().is_none());
    }

    #[test]
    fn stale_samples_are_not_observations() {
        let mut tracker = GazeTracker::with_clock(2, ManualClock::new());
        assert!(tracker.ingest_sample(sample(10.0, true)));
        assert!(!tracker.ingest_sample(sample(10.0, true)));
        assert!(!tracker.ingest_sample(sample(9.0, true)));
        assert!(!tracker.is_looking_at_target());
        assert!(tracker.ingest_sample(sample(11.0, true)));
        assert!(tracker.is_looking_at_target());
        assert_eq!(tracker.latest_sample().unwrap().timestamp, 11.0);
    }

    #[test]
    fn non_finite_timestamps_are_dropped() {
        let mut tracker = GazeTracker::with_clock(1, ManualClock::new());
        assert!(tracker.ingest_sample(sample(10.0, false)));
        assert!(!tracker.ingest_sample(sample(f64::NAN, true)));
        assert!(!tracker.ingest_sample(sample(f64::INFINITY, true)));
        assert!(!tracker.ingest_sample(sample(1.0, true)));
        assert!(!tracker.is_looking_at_target());
        assert_eq!(tracker.latest_sample().unwrap().timestamp, 10.0);

        let mut fresh = GazeTracker::with_clock(1, ManualClock::new());
        assert!(!fresh.ingest_sample(sample(f64::NAN, true)));
        assert!(fresh.latest_sample().is_none());
        assert!(fresh.ingest_sample(sample(0.5, true)));
    }

    #[test]
    fn ingest_uses_latest_gaze_of_frame() {
        let mut tracker = GazeTracker::with_clock(1, ManualClock::new());
        let mut late = sample(5.0, true);
        late.normalized_position = [0.9, 0.1];
        let frame = SurfaceFrame {
            gaze_on_surfaces: vec![sample(4.0, false), late, sample(3.0, false)],
            timestamp: 5.0,
            ..Default::default()
        };
        assert!(tracker.ingest(frame));
        assert!(tracker.is_looking_at_target());
        assert_eq!(tracker.current_position(), [0.9, 0.1]);
        assert!(!tracker.ingest(SurfaceFrame::default()));
    }

    #[test]
    fn dwell_follows_clock_while_on_target() {
        let clock = ManualClock::new();
        let mut tracker = GazeTracker::with_clock(2, clock.clone());
        clock.set(Duration::from_secs(100));
        tracker.ingest_sample(sample(1.0, true));
        assert_eq!(tracker.dwell(), Duration::ZERO);
        clock.advance(Duration::from_millis(20));
        tracker.ingest_sample(sample(2.0, true));
        assert!(tracker.is_looking_at_target());

        clock.advance(Duration::from_millis(1_500));
        assert_eq!(tracker.dwell(), Duration::from_millis(1_500));
        clock.advance(Duration::from_millis(500));
        assert!((tracker.dwell_seconds() - 2.0).abs() < 1e-9);

        tracker.ingest_sample(sample(3.0, false));
        assert!(tracker.dwell_seconds() > 0.0);
        tracker.ingest_sample(sample(4.0, false));
        assert!(!tracker.is_looking_at_target());
        assert_eq!(tracker.dwell(), Duration::ZERO);

        tracker.ingest_sample(sample(5.0, true));
        tracker.ingest_sample(sample(6.0, true));
        clock.advance(Duration::from_millis(300));
        assert_eq!(tracker.dwell(), Duration::from_millis(300));
    }
}
