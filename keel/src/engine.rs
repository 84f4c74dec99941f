//! Transport engine seam.
//!
//! The reliable-delivery algorithm (sequencing, retransmission, window and
//! acknowledgment bookkeeping) lives behind [`TransportEngine`]. A session
//! drives its engine through this narrow surface and never looks inside.
//!
//! Engines emit raw datagrams on their own (typically through an output
//! callback supplied at construction); that path is not part of this trait.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::timing::{Millis, Timestamp};

/// Connection identifier assigned by the engine (the KCP `conv`).
///
/// Stable for the lifetime of a session and used as the registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ConnectionId(u32);

impl ConnectionId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for ConnectionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<ConnectionId> for u32 {
    fn from(id: ConnectionId) -> Self {
        id.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failures reported by an engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Datagram shorter than the engine's header.
    #[error("datagram too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    /// Datagram addressed to another connection.
    #[error("conversation mismatch: expected {expected}, got {actual}")]
    ConversationMismatch {
        expected: ConnectionId,
        actual: ConnectionId,
    },
    /// Datagram failed the engine's own validation.
    #[error("malformed datagram: {0}")]
    Malformed(String),
    /// Application payload the engine refuses to segment.
    #[error("payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    /// Engine used after `release`.
    #[error("engine already released")]
    Released,
}

/// Narrow capability set a session needs from a reliable-delivery engine.
///
/// All methods are called from the owning session's tick thread only, with
/// the exception of `release`, which the closing thread calls while holding
/// the session's engine lock.
pub trait TransportEngine: Send {
    /// Connection identifier this engine was created for.
    fn connection_id(&self) -> ConnectionId;

    /// Feeds one raw datagram received from the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram is rejected. The session logs it and
    /// keeps going.
    fn input(&mut self, datagram: &[u8]) -> Result<(), EngineError>;

    /// Queues application payload for reliable delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot accept the payload.
    fn send(&mut self, payload: &[u8]) -> Result<(), EngineError>;

    /// Advances engine time. Called once per tick with the tick start time.
    fn update(&mut self, now: Timestamp<Millis>);

    /// Next payload the engine considers delivered, in delivery order.
    fn recv(&mut self) -> Option<Bytes>;

    /// Segments queued or in flight that the peer has not acknowledged.
    fn outstanding_send_count(&self) -> usize;

    /// Frees engine resources. Called exactly once, at session close.
    fn release(&mut self);
}

impl<E: TransportEngine + ?Sized> TransportEngine for Box<E> {
    fn connection_id(&self) -> ConnectionId {
        (**self).connection_id()
    }

    fn input(&mut self, datagram: &[u8]) -> Result<(), EngineError> {
        (**self).input(datagram)
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), EngineError> {
        (**self).send(payload)
    }

    fn update(&mut self, now: Timestamp<Millis>) {
        (**self).update(now);
    }

    fn recv(&mut self) -> Option<Bytes> {
        (**self).recv()
    }

    fn outstanding_send_count(&self) -> usize {
        (**self).outstanding_send_count()
    }

    fn release(&mut self) {
        (**self).release();
    }
}
