//! Pulse scheduling.
//!
//! - [`clock`] - drift-corrected beat timing (pure)
//! - [`scheduler`] - actor that gates the clock on mode and rate
//! - [`rate_feed`] - publishing and following heart-rate documents

pub mod clock;
pub mod rate_feed;
pub mod scheduler;

pub use clock::{beat_interval, BeatClock, ClockEvent, SkipReason};
pub use rate_feed::{RateFeed, RateFollower};
pub use scheduler::{
    PulseEvent, PulseSchedulerHandle, RateSource, SchedulerConfig, SchedulerState,
    SchedulerStatus,
};
