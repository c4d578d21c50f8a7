//! Drift-corrected beat clock.
//!
//! Pure timing logic with no I/O: the scheduler feeds it the current instant
//! on every check tick and acts on the returned events.
//!
//! The anchor is the instant the last beat was due. On each tick, once
//! `now - anchor >= interval`, the anchor advances by exactly one interval,
//! which keeps phase and absorbs tick jitter. If the advanced anchor would
//! still lag `now` by more than an interval (the process was suspended, or
//! the rate jumped), it snaps to `now` instead of firing a burst of catch-up
//! beats.
//!
//! Two guards prevent double fires: the `is_animating` latch (a beat is not
//! fired while the previous two-phase pulse is still running) and a
//! refractory window of half the current interval since the last fired beat.

use std::time::Duration;
use tokio::time::Instant;

/// Secondary pulse offset as a fraction of the interval.
pub const SECONDARY_PULSE_FRACTION: f64 = 0.15;

/// Length of the full two-phase pulse as a fraction of the interval. The
/// latch clears when it completes.
pub const PULSE_SEQUENCE_FRACTION: f64 = 0.30;

/// Minimum spacing between fired beats, as a fraction of the interval.
pub const MIN_BEAT_SPACING_FRACTION: f64 = 0.5;

/// Interval between beats for a rate in beats per minute.
///
/// Rates below 1 bpm (including zero, negative and NaN) are treated as 1.
#[must_use]
pub fn beat_interval(bpm: f64) -> Duration {
    let rate = if bpm.is_nan() { 1.0 } else { bpm.max(1.0) };
    Duration::from_secs_f64(60.0 / rate)
}

/// Why a due beat was not fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Previous pulse sequence still running.
    Latched,
    /// Too close to the previous beat.
    Refractory,
}

impl SkipReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Latched => "latched",
            SkipReason::Refractory => "refractory",
        }
    }
}

/// Output of one clock tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    /// Primary pulse. `drift` is how late it fired relative to its due time.
    Beat { drift: Duration },
    Secondary,
    /// The two-phase pulse finished; the latch is released.
    SequenceComplete,
    Skipped(SkipReason),
}

/// Beat schedule state.
#[derive(Debug, Clone)]
pub struct BeatClock {
    interval: Duration,
    anchor: Instant,
    is_animating: bool,
    last_beat: Option<Instant>,
    secondary_due: Option<Instant>,
    complete_due: Option<Instant>,
}

impl BeatClock {
    /// New clock anchored at `now`. The first beat is due one interval later.
    #[must_use]
    pub fn new(bpm: f64, now: Instant) -> Self {
        Self {
            interval: beat_interval(bpm),
            anchor: now,
            is_animating: false,
            last_beat: None,
            secondary_due: None,
            complete_due: None,
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn anchor(&self) -> Instant {
        self.anchor
    }

    #[must_use]
    pub fn is_animating(&self) -> bool {
        self.is_animating
    }

    /// Change the rate. The anchor is kept so the next beat is due one new
    /// interval after the previous beat.
    pub fn set_rate(&mut self, bpm: f64) {
        self.interval = beat_interval(bpm);
    }

    /// Re-anchor at `now` and drop any running pulse sequence (used when
    /// resuming from pause).
    pub fn reset(&mut self, now: Instant) {
        self.anchor = now;
        self.is_animating = false;
        self.secondary_due = None;
        self.complete_due = None;
    }

    /// Advance the clock to `now`.
    pub fn on_tick(&mut self, now: Instant) -> Vec<ClockEvent> {
        let mut events = Vec::new();

        if self.secondary_due.is_some_and(|due| now >= due) {
            self.secondary_due = None;
            events.push(ClockEvent::Secondary);
        }
        if self.complete_due.is_some_and(|due| now >= due) {
            self.complete_due = None;
            self.is_animating = false;
            events.push(ClockEvent::SequenceComplete);
        }

        let elapsed = now.saturating_duration_since(self.anchor);
        if elapsed < self.interval {
            return events;
        }

        let due = self.anchor + self.interval;
        let lag = now.saturating_duration_since(due);
        if lag > self.interval {
            self.anchor = now;
        } else {
            self.anchor = due;
        }

        if self.is_animating {
            events.push(ClockEvent::Skipped(SkipReason::Latched));
            return events;
        }
        let min_spacing = self.interval.mul_f64(MIN_BEAT_SPACING_FRACTION);
        if self
            .last_beat
            .is_some_and(|last| now.saturating_duration_since(last) < min_spacing)
        {
            events.push(ClockEvent::Skipped(SkipReason::Refractory));
            return events;
        }

        self.is_animating = true;
        self.last_beat = Some(now);
        self.secondary_due = Some(now + self.interval.mul_f64(SECONDARY_PULSE_FRACTION));
        self.complete_due = Some(now + self.interval.mul_f64(PULSE_SEQUENCE_FRACTION));
        events.push(ClockEvent::Beat { drift: lag });
        events
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(50);

    fn beats(events: &[ClockEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ClockEvent::Beat { .. }))
            .count()
    }

    #[test]
    fn test_beat_interval() {
        assert_eq!(beat_interval(60.0), Duration::from_secs(1));
        assert_eq!(beat_interval(120.0), Duration::from_millis(500));
        assert_eq!(beat_interval(0.0), Duration::from_secs(60));
        assert_eq!(beat_interval(-5.0), Duration::from_secs(60));
        assert_eq!(beat_interval(f64::NAN), Duration::from_secs(60));

        let interval = beat_interval(72.0).as_secs_f64();
        assert!((interval - 0.8333).abs() < 0.001);
    }

    #[tokio::test(start_paused = true)]
    async fn test_constant_rate_fires_once_per_interval() {
        let start = Instant::now();
        let mut clock = BeatClock::new(60.0, start);
        let mut fired = Vec::new();

        let mut now = start;
        while now < start + Duration::from_secs(10) {
            now += TICK;
            if beats(&clock.on_tick(now)) > 0 {
                fired.push(now);
            }
        }

        assert_eq!(fired.len(), 10);
        for pair in fired.windows(2) {
            let [a, b] = pair else { unreachable!() };
            let spacing = b.duration_since(*a);
            assert!(spacing >= Duration::from_secs(1) - TICK);
            assert!(spacing <= Duration::from_secs(1) + TICK);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_phase_pulse_and_latch() {
        let start = Instant::now();
        let mut clock = BeatClock::new(60.0, start);

        let events = clock.on_tick(start + Duration::from_secs(1));
        assert_eq!(beats(&events), 1);
        assert!(clock.is_animating());

        let events = clock.on_tick(start + Duration::from_millis(1150));
        assert_eq!(events, vec![ClockEvent::Secondary]);

        let events = clock.on_tick(start + Duration::from_millis(1300));
        assert_eq!(events, vec![ClockEvent::SequenceComplete]);
        assert!(!clock.is_animating());
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_stall_snaps_anchor_without_burst() {
        let start = Instant::now();
        let mut clock = BeatClock::new(60.0, start);

        // Ten intervals pass with no tick
        let late = start + Duration::from_secs(10);
        let events = clock.on_tick(late);
        assert_eq!(beats(&events), 1);
        assert_eq!(clock.anchor(), late);

        // Following ticks do not catch up on missed beats
        let events = clock.on_tick(late + Duration::from_millis(500));
        assert_eq!(beats(&events), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_increase_respects_refractory_window() {
        let start = Instant::now();
        let mut clock = BeatClock::new(30.0, start);
        let mut fired = Vec::new();

        let mut now = start;
        while now < start + Duration::from_secs(12) {
            now += TICK;
            if now == start + Duration::from_secs(3) {
                clock.set_rate(180.0);
            }
            if beats(&clock.on_tick(now)) > 0 {
                fired.push(now);
            }
        }

        let min_spacing = beat_interval(180.0).mul_f64(MIN_BEAT_SPACING_FRACTION);
        for pair in fired.windows(2) {
            let [a, b] = pair else { unreachable!() };
            assert!(b.duration_since(*a) >= min_spacing);
        }
    }
}
