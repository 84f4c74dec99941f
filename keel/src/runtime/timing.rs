//! Timing primitives.
//!
//! Typed millisecond durations and timestamps, and the clocks sessions
//! read them from.

mod clock;
mod time;

pub use clock::{Clock, ManualClock, SystemClock};
pub use time::{Duration, Millis, TimeUnit, Timestamp};
