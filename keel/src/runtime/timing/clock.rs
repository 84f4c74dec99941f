//! Millisecond clocks driving session time.
//!
//! Sessions read time once per tick through a [`Clock`]. Production uses
//! [`SystemClock`]; tests substitute [`ManualClock`] to step time exactly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::time::{Duration, Millis, Timestamp};

/// Source of the current time in milliseconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp<Millis>;
}

/// Wall-clock milliseconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp<Millis> {
        // A clock set before 1970 reads as the epoch.
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Timestamp::new(millis)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub const fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::Release);
    }

    pub fn advance(&self, by: Duration<Millis>) {
        self.now.fetch_add(by.as_u64(), Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp<Millis> {
        Timestamp::new(self.now.load(Ordering::Acquire))
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Timestamp<Millis> {
        (**self).now()
    }
}
