//! Runtime that drives sessions.
//!
//! - `loop_group`: loop threads that tick registered sessions on a cadence.
//! - `timing`: typed durations, timestamps, and clocks.
//! - `topology`: CPU detection and loop-thread pinning.

pub mod loop_group;
pub mod timing;
pub mod topology;
