//! Application-facing hook for delivered payloads.

use bytes::Bytes;

use crate::engine::{ConnectionId, EngineError, TransportEngine};

use super::state::CloseReason;

/// Handles payloads the engine has delivered, in delivery order.
///
/// This is the only extension point of a session: the tick mechanics are
/// fixed, what happens to a delivered payload is not. Any
/// `FnMut(&mut Context<'_>, Bytes) + Send` closure is a handler.
pub trait PayloadHandler: Send {
    /// Called on the tick thread for every delivered payload.
    fn on_payload(&mut self, ctx: &mut Context<'_>, payload: Bytes);

    /// Called once, by whichever thread wins the close, after the engine is
    /// released.
    fn on_close(&mut self, _conv: ConnectionId, _reason: CloseReason) {}
}

impl<F> PayloadHandler for F
where
    F: FnMut(&mut Context<'_>, Bytes) + Send,
{
    fn on_payload(&mut self, ctx: &mut Context<'_>, payload: Bytes) {
        self(ctx, payload);
    }
}

/// Tick-scoped view of the session handed to [`PayloadHandler::on_payload`].
///
/// [`Context::close`] is the direct way for a handler to end its session.
/// Closing through the session handle or a registry works too; the release
/// then happens once the handler returns.
pub struct Context<'a> {
    conv: ConnectionId,
    engine: &'a mut dyn TransportEngine,
    close_requested: bool,
}

impl<'a> Context<'a> {
    pub(crate) fn new(conv: ConnectionId, engine: &'a mut dyn TransportEngine) -> Self {
        Self {
            conv,
            engine,
            close_requested: false,
        }
    }

    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.conv
    }

    /// Hands a reply to the engine immediately.
    ///
    /// # Errors
    ///
    /// Propagates the engine's rejection.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), EngineError> {
        self.engine.send(payload)
    }

    /// Requests a close once this payload returns. Payloads still pending in
    /// the engine are not dispatched.
    pub fn close(&mut self) {
        self.close_requested = true;
    }

    #[must_use]
    pub const fn is_close_requested(&self) -> bool {
        self.close_requested
    }
}
