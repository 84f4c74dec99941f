//! Session lifecycle state and close reasons.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::runtime::timing::{Duration, Millis};

const OPEN: u8 = 0;
const CLOSED: u8 = 1;

/// Observable lifecycle state. There is no connecting phase: a session is
/// open from construction, and `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Open,
    Closed,
}

/// Atomic one-way `Open -> Closed` latch.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) const fn open() -> Self {
        Self(AtomicU8::new(OPEN))
    }

    #[inline]
    pub(crate) fn load(&self) -> State {
        match self.0.load(Ordering::Acquire) {
            OPEN => State::Open,
            _ => State::Closed,
        }
    }

    #[inline]
    pub(crate) fn is_open(&self) -> bool {
        self.load() == State::Open
    }

    /// Flips to `Closed`. Exactly one caller ever gets `true`.
    #[inline]
    pub(crate) fn try_close(&self) -> bool {
        self.0
            .compare_exchange(OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close` was called from outside the session.
    Requested,
    /// The payload handler asked to close through its [`Context`](super::Context).
    Handler,
    /// No inbound datagram for longer than the idle timeout.
    IdleTimeout { idle: Duration<Millis> },
    /// The engine's unacknowledged send depth passed the ceiling.
    Backpressure { outstanding: usize, ceiling: usize },
}

impl CloseReason {
    /// Whether this close indicates a misbehaving or unresponsive peer.
    #[must_use]
    pub const fn is_abnormal(&self) -> bool {
        matches!(self, Self::Backpressure { .. })
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("close requested"),
            Self::Handler => f.write_str("closed by payload handler"),
            Self::IdleTimeout { idle } => write!(f, "idle for {idle}"),
            Self::Backpressure {
                outstanding,
                ceiling,
            } => write!(f, "{outstanding} segments awaiting ack (ceiling {ceiling})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn latch_is_one_way() {
        let state = StateCell::open();
        assert!(state.is_open());
        assert!(state.try_close());
        assert_eq!(state.load(), State::Closed);
        assert!(!state.try_close());
        assert!(!state.is_open());
    }

    #[test]
    fn single_winner_under_contention() {
        let state = Arc::new(StateCell::open());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let state = Arc::clone(&state);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if state.try_close() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_reason_display() {
        let reason = CloseReason::Backpressure {
            outstanding: 129,
            ceiling: 128,
        };
        assert!(reason.is_abnormal());
        assert_eq!(reason.to_string(), "129 segments awaiting ack (ceiling 128)");

        let idle = CloseReason::IdleTimeout {
            idle: Duration::from_millis(180_001),
        };
        assert!(!idle.is_abnormal());
        assert_eq!(idle.to_string(), "idle for 180001ms");
    }
}
