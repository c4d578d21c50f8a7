//! Pulse scheduler timing tests
//!
//! Beat spacing at a constant rate, across rate changes, and across stalls.
//! The check tick is 10 ms, so every spacing assertion allows one tick.

use pulse_core::pulse::{beat_interval, PulseSchedulerHandle, RateSource, SchedulerState};
use pulse_test_utils::{beat_times, collect_for, fine_scheduler, gaps};
use std::time::Duration;

const TICK: Duration = Duration::from_millis(10);

fn within_one_tick(actual: Duration, expected: Duration) -> bool {
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    diff <= TICK + Duration::from_millis(1)
}

async fn running_scheduler(bpm: f64) -> PulseSchedulerHandle {
    let scheduler = PulseSchedulerHandle::new(fine_scheduler());
    scheduler
        .set_gate(Some(RateSource::LocalSensor))
        .await
        .unwrap();
    scheduler
        .update_rate(bpm, RateSource::LocalSensor)
        .await
        .unwrap();
    scheduler
        .subscribe_status()
        .wait_for(|s| s.state == SchedulerState::Running)
        .await
        .unwrap();
    scheduler
}

/// At a constant 72 bpm, beats are ~0.833 s apart.
#[tokio::test(start_paused = true)]
async fn test_constant_rate_beat_spacing() {
    // Arrange
    let scheduler = running_scheduler(72.0).await;
    let mut events = scheduler.subscribe();
    let expected = beat_interval(72.0);
    assert!((expected.as_secs_f64() - 0.8333).abs() < 0.001);
    assert_eq!(scheduler.status().interval, Some(expected));

    // Act
    let collected = collect_for(&mut events, Duration::from_secs(20)).await;

    // Assert
    let beats = beat_times(&collected);
    assert!(beats.len() >= 23, "Expected ~24 beats, got {}", beats.len());
    for gap in gaps(&beats) {
        assert!(
            within_one_tick(gap, expected),
            "Beat gap {gap:?} differs from {expected:?} by more than one tick"
        );
    }

    scheduler.cancel();
}

/// Beats do not drift: the n-th beat lands within one tick of n intervals.
#[tokio::test(start_paused = true)]
async fn test_no_cumulative_drift() {
    let scheduler = running_scheduler(72.0).await;
    let mut events = scheduler.subscribe();
    let expected = beat_interval(72.0);

    let beats = beat_times(&collect_for(&mut events, Duration::from_secs(60)).await);
    let first = *beats.first().expect("beats collected");
    let last = *beats.last().expect("beats collected");
    let count = u32::try_from(beats.len() - 1).unwrap();

    assert!(count >= 70, "Expected ~72 beats, got {}", count + 1);
    assert!(within_one_tick(last.duration_since(first), expected * count));

    scheduler.cancel();
}

/// A mid-run rate change never produces beats closer than half the new
/// interval, and settles on the new interval.
#[tokio::test(start_paused = true)]
async fn test_rate_change_respects_min_spacing() {
    // Arrange
    let scheduler = running_scheduler(60.0).await;
    let mut events = scheduler.subscribe();
    tokio::time::sleep(Duration::from_millis(2_700)).await;

    // Act - double the rate mid-interval
    scheduler
        .update_rate(120.0, RateSource::LocalSensor)
        .await
        .unwrap();
    let beats = beat_times(&collect_for(&mut events, Duration::from_secs(10)).await);

    // Assert
    let new_interval = beat_interval(120.0);
    let spacing = gaps(&beats);
    for gap in &spacing {
        assert!(
            *gap >= new_interval / 2,
            "Beats {gap:?} apart, closer than half of {new_interval:?}"
        );
    }
    let settled = spacing.iter().rev().take(5);
    for gap in settled {
        assert!(within_one_tick(*gap, new_interval));
    }

    scheduler.cancel();
}

/// Slowing down stretches the gap to the next beat instead of firing early.
#[tokio::test(start_paused = true)]
async fn test_slowdown_waits_for_new_interval() {
    let scheduler = running_scheduler(120.0).await;
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let mut events = scheduler.subscribe();

    scheduler
        .update_rate(40.0, RateSource::LocalSensor)
        .await
        .unwrap();
    let beats = beat_times(&collect_for(&mut events, Duration::from_secs(10)).await);

    let slow = beat_interval(40.0);
    assert!(beats.len() >= 5, "Expected ~6 beats, got {}", beats.len());
    for gap in gaps(&beats) {
        assert!(within_one_tick(gap, slow), "Gap {gap:?}, expected {slow:?}");
    }

    scheduler.cancel();
}
