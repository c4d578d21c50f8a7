//! Helpers for draining broadcast channels in tests.

use pulse_core::pulse::PulseEvent;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::Instant;

/// Everything currently buffered in `rx`, skipping lag gaps.
pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(item) => items.push(item),
            Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => return items,
        }
    }
}

/// Receive for `window` of (tokio) time and return everything received.
pub async fn collect_for<T: Clone>(rx: &mut broadcast::Receiver<T>, window: Duration) -> Vec<T> {
    let deadline = Instant::now() + window;
    let mut items = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(item)) => items.push(item),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return items,
        }
    }
}

/// Instants of the primary beats in `events`.
#[must_use]
pub fn beat_times(events: &[PulseEvent]) -> Vec<Instant> {
    events
        .iter()
        .filter_map(|event| match event {
            PulseEvent::Beat { at, .. } => Some(*at),
            PulseEvent::SecondaryPulse { .. } | PulseEvent::PulseComplete { .. } => None,
        })
        .collect()
}

/// Gaps between consecutive instants.
#[must_use]
pub fn gaps(times: &[Instant]) -> Vec<Duration> {
    times
        .windows(2)
        .map(|pair| pair[1].duration_since(pair[0]))
        .collect()
}
