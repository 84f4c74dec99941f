//! Per-connection session supervisor.
//!
//! A [`Session`] binds one connection id to one [`TransportEngine`], an
//! inbound datagram queue, an outbound payload queue, and the liveness and
//! backpressure policy around them.
//!
//! # Threads
//!
//! ```text
//!  network rx threads ──submit_raw──▶ inbound queue ─┐
//!  application ───send_application──▶ outbound queue ┤
//!                                                    ▼
//!  loop thread ───────────────tick──▶ engine ──recv──▶ PayloadHandler
//!  anyone ────────────────────close──▶ registry / scheduler / engine
//! ```
//!
//! `submit_raw` and `send_application` only push onto lock-free queues and
//! never contend with a running tick. The engine sits behind a mutex that
//! exists to serialize `release` against an in-flight tick; ticks themselves
//! never contend, the scheduler runs at most one tick per session at a time.
//!
//! # Tick
//!
//! 1. Return if the session is closed.
//! 2. Drain the inbound queue into `engine.input`. A rejected datagram is
//!    logged and skipped.
//! 3. Drain the outbound queue into `engine.send`.
//! 4. `engine.update(now)` once, with the tick's start time.
//! 5. Drain `engine.recv` and dispatch each payload to the handler in order.
//! 6. Idle policy: close if nothing arrived this tick and the last active
//!    tick is more than `idle_timeout` ago.
//! 7. Backpressure policy: close if the engine's outstanding-send depth is
//!    above `max_outstanding_send`.
//!
//! Delivered payloads always reach the handler before either policy can
//! close the session in the same tick.

mod handler;
mod state;

use std::cell::Cell;
use std::fmt;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use bytes::Bytes;

use crate::config::{ConfigError, SessionConfig};
use crate::engine::{ConnectionId, TransportEngine};
use crate::registry::SessionRegistry;
use crate::runtime::loop_group::{LoopHandle, LoopScheduler};
use crate::runtime::timing::{Clock, Millis, Timestamp};
use crate::sync::inbound::{self, Consumer, Producer};
use crate::trace::{debug, error, info, trace, warn};

pub use handler::{Context, PayloadHandler};
pub use state::{CloseReason, State};

use state::StateCell;

thread_local! {
    /// Address of the session whose tick is running on this thread, or 0.
    static TICKING: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as ticking one session until dropped.
struct TickMark {
    previous: usize,
}

impl TickMark {
    fn enter(session: usize) -> Self {
        Self {
            previous: TICKING.replace(session),
        }
    }
}

impl Drop for TickMark {
    fn drop(&mut self) {
        TICKING.set(self.previous);
    }
}

/// Object-safe session surface used by registries and schedulers.
pub trait ManagedSession: Send + Sync {
    fn connection_id(&self) -> ConnectionId;

    /// Queues a raw datagram for the next tick. Never blocks or fails.
    fn submit_raw(&self, datagram: Bytes);

    /// Queues application payload for the engine. Fire-and-forget.
    fn send_application(&self, payload: Bytes);

    /// One servicing pass. Scheduler use only.
    fn tick(&self);

    /// Idempotent teardown.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Counters kept by the tick. Read with [`Session::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub ticks: u64,
    pub datagrams_ingested: u64,
    pub datagrams_rejected: u64,
    pub payloads_sent: u64,
    pub sends_rejected: u64,
    pub payloads_delivered: u64,
    /// Queued items dropped at close without reaching the engine.
    pub discarded_at_close: u64,
}

/// State only the tick (or the closing thread, under the lock) touches.
struct Core<E, H> {
    engine: E,
    handler: H,
    inbound: Consumer<Bytes>,
    outbound: Consumer<Bytes>,
    last_activity: Timestamp<Millis>,
    released: bool,
    stats: SessionStats,
}

impl<E: TransportEngine, H: PayloadHandler> Core<E, H> {
    /// Feeds every queued datagram to the engine. Returns whether any arrived.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn ingest(&mut self, conv: ConnectionId) -> bool {
        let mut had_activity = false;
        for datagram in self.inbound.drain() {
            had_activity = true;
            match self.engine.input(&datagram) {
                Ok(()) => self.stats.datagrams_ingested += 1,
                Err(err) => {
                    self.stats.datagrams_rejected += 1;
                    warn!(conv = %conv, len = datagram.len(), error = %err, "engine rejected datagram");
                }
            }
        }
        had_activity
    }

    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn flush_outbound(&mut self, conv: ConnectionId) {
        for payload in self.outbound.drain() {
            match self.engine.send(&payload) {
                Ok(()) => self.stats.payloads_sent += 1,
                Err(err) => {
                    self.stats.sends_rejected += 1;
                    warn!(conv = %conv, len = payload.len(), error = %err, "engine rejected payload");
                }
            }
        }
    }

    /// Dispatches delivered payloads. Returns `true` if the handler asked to
    /// close through its context. Dispatch also stops once `state` is
    /// closed; remaining payloads stay in the engine.
    fn deliver(&mut self, conv: ConnectionId, state: &StateCell) -> bool {
        let Self {
            engine,
            handler,
            stats,
            ..
        } = self;

        while let Some(payload) = engine.recv() {
            stats.payloads_delivered += 1;
            let mut ctx = Context::new(conv, &mut *engine);
            handler.on_payload(&mut ctx, payload);
            if ctx.is_close_requested() {
                return true;
            }
            if !state.is_open() {
                break;
            }
        }
        false
    }

    fn release(&mut self, conv: ConnectionId, reason: CloseReason) {
        if self.released {
            return;
        }
        self.released = true;
        self.engine.release();

        let discarded = self.inbound.drain().count() + self.outbound.drain().count();
        self.stats.discarded_at_close += discarded as u64;

        self.handler.on_close(conv, reason);
    }
}

/// Supervisor for one reliable connection.
///
/// Created with [`Session::open`], which registers it with a scheduler.
/// Holds only weak references to its registry and scheduler.
pub struct Session<E: TransportEngine, H: PayloadHandler> {
    conv: ConnectionId,
    config: SessionConfig,
    state: StateCell,
    close_reason: OnceLock<CloseReason>,
    clock: Arc<dyn Clock>,
    inbound: Producer<Bytes>,
    outbound: Producer<Bytes>,
    core: Mutex<Core<E, H>>,
    registry: Weak<dyn SessionRegistry>,
    scheduler: Weak<dyn LoopScheduler>,
    loop_handle: OnceLock<LoopHandle>,
}

impl<E, H> Session<E, H>
where
    E: TransportEngine + 'static,
    H: PayloadHandler + 'static,
{
    /// Builds a session around a fresh engine and registers it with
    /// `scheduler`. The session starts open; its idle clock starts now.
    ///
    /// Inserting into the registry is left to the caller (see
    /// [`Registry::open_session`](crate::registry::Registry::open_session)).
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation. Nothing is registered
    /// in that case.
    pub fn open<R, S>(
        engine: E,
        handler: H,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
        registry: &Arc<R>,
        scheduler: &Arc<S>,
    ) -> Result<Arc<Self>, ConfigError>
    where
        R: SessionRegistry + 'static,
        S: LoopScheduler + 'static,
    {
        config.validate()?;

        let conv = engine.connection_id();
        let (inbound_tx, inbound_rx) = inbound::channel();
        let (outbound_tx, outbound_rx) = inbound::channel();
        let registry: Weak<R> = Arc::downgrade(registry);
        let registry: Weak<dyn SessionRegistry> = registry;
        let scheduler_ref: Weak<S> = Arc::downgrade(scheduler);
        let scheduler_ref: Weak<dyn LoopScheduler> = scheduler_ref;

        let session = Arc::new(Self {
            conv,
            config,
            state: StateCell::open(),
            close_reason: OnceLock::new(),
            inbound: inbound_tx,
            outbound: outbound_tx,
            core: Mutex::new(Core {
                engine,
                handler,
                inbound: inbound_rx,
                outbound: outbound_rx,
                last_activity: clock.now(),
                released: false,
                stats: SessionStats::default(),
            }),
            clock,
            registry,
            scheduler: scheduler_ref,
            loop_handle: OnceLock::new(),
        });

        let handle = scheduler.register(Arc::clone(&session) as Arc<dyn ManagedSession>);
        let _ = session.loop_handle.set(handle);

        debug!(
            conv = %conv,
            loop_handle = %handle,
            idle_timeout = %config.idle_timeout,
            max_outstanding_send = config.max_outstanding_send,
            "session opened"
        );

        Ok(session)
    }
}

impl<E: TransportEngine, H: PayloadHandler> Session<E, H> {
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.conv
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state.load()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// Reason recorded by the close winner, once closed.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Loop assignment returned by the scheduler at open.
    #[must_use]
    pub fn loop_handle(&self) -> Option<LoopHandle> {
        self.loop_handle.get().copied()
    }

    /// Datagrams queued and not yet drained by a tick (approximate).
    #[must_use]
    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    /// Snapshot of tick counters.
    ///
    /// Takes the engine lock; do not call from inside a payload handler.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.lock_core().stats
    }

    /// Queues a raw datagram believed to belong to this connection.
    ///
    /// Origin is not validated here. After close the datagram is dropped.
    pub fn submit_raw(&self, datagram: Bytes) {
        if !self.state.is_open() {
            trace!(conv = %self.conv, len = datagram.len(), "dropping datagram for closed session");
            return;
        }
        self.inbound.push(datagram);
    }

    /// Queues payload for reliable delivery. The next tick hands it to the
    /// engine, so only the tick thread ever mutates the engine. After close
    /// the payload is dropped.
    pub fn send_application(&self, payload: Bytes) {
        if !self.state.is_open() {
            trace!(conv = %self.conv, len = payload.len(), "dropping payload for closed session");
            return;
        }
        self.outbound.push(payload);
    }

    /// Closes the session. Idempotent and safe from any thread.
    ///
    /// The first caller removes the session from its registry, deregisters
    /// it from its scheduler and releases the engine, waiting for an
    /// in-flight tick on another thread to finish first. Later callers
    /// return immediately. Called from inside this session's own payload
    /// handler, the release happens as soon as the handler returns and no
    /// further payload is dispatched.
    pub fn close(&self) {
        self.shut_down(CloseReason::Requested, None);
    }

    /// One servicing pass. See the module docs for the step order.
    pub fn tick(&self) {
        if !self.state.is_open() {
            return;
        }
        let mut core = self.lock_core();
        // A close may have won while this tick waited for the lock.
        if !self.state.is_open() {
            return;
        }
        let _mark = TickMark::enter(self.addr());

        let now = self.clock.now();
        core.stats.ticks += 1;

        let had_activity = core.ingest(self.conv);
        core.flush_outbound(self.conv);
        core.engine.update(now);

        if core.deliver(self.conv, &self.state) {
            self.shut_down(CloseReason::Handler, Some(&mut *core));
        }
        if !self.state.is_open() {
            // A handler that closed through the session handle left the
            // release to this tick.
            let reason = self.close_reason().unwrap_or(CloseReason::Requested);
            core.release(self.conv, reason);
            return;
        }

        if had_activity {
            core.last_activity = now;
        } else {
            let idle = now - core.last_activity;
            if idle > self.config.idle_timeout {
                self.shut_down(CloseReason::IdleTimeout { idle }, Some(&mut *core));
                return;
            }
        }

        let outstanding = core.engine.outstanding_send_count();
        let ceiling = self.config.max_outstanding_send;
        if outstanding > ceiling {
            self.shut_down(
                CloseReason::Backpressure {
                    outstanding,
                    ceiling,
                },
                Some(&mut *core),
            );
        }
    }

    /// Single-winner teardown. `held` is the core when the caller already
    /// owns the lock (policy closes from inside `tick`).
    fn shut_down(&self, reason: CloseReason, held: Option<&mut Core<E, H>>) {
        if !self.state.try_close() {
            return;
        }
        let _ = self.close_reason.set(reason);

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.conv);
        }
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.deregister(self.conv);
        }

        match held {
            Some(core) => core.release(self.conv, reason),
            // This thread is inside this session's tick (a payload handler
            // called `close`) and already holds the lock.
            None if self.is_ticking_here() => {
                trace!(conv = %self.conv, "release deferred to running tick");
            }
            None => self.lock_core().release(self.conv, reason),
        }

        if reason.is_abnormal() {
            error!(conv = %self.conv, reason = %reason, "session closed");
        } else if matches!(reason, CloseReason::IdleTimeout { .. }) {
            info!(conv = %self.conv, reason = %reason, "session closed");
        } else {
            debug!(conv = %self.conv, reason = %reason, "session closed");
        }
    }

    fn addr(&self) -> usize {
        ptr::from_ref(self).addr()
    }

    fn is_ticking_here(&self) -> bool {
        TICKING.get() == self.addr()
    }

    /// A handler that panicked on another thread poisons the lock; the core
    /// is still consistent enough to close and release.
    fn lock_core(&self) -> MutexGuard<'_, Core<E, H>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: TransportEngine, H: PayloadHandler> ManagedSession for Session<E, H> {
    fn connection_id(&self) -> ConnectionId {
        self.conv
    }

    fn submit_raw(&self, datagram: Bytes) {
        Session::submit_raw(self, datagram);
    }

    fn send_application(&self, payload: Bytes) {
        Session::send_application(self, payload);
    }

    fn tick(&self) {
        Session::tick(self);
    }

    fn close(&self) {
        Session::close(self);
    }

    fn is_open(&self) -> bool {
        Session::is_open(self)
    }
}

impl<E: TransportEngine, H: PayloadHandler> fmt::Debug for Session<E, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("conv", &self.conv)
            .field("state", &self.state.load())
            .field("close_reason", &self.close_reason.get())
            .field("loop_handle", &self.loop_handle.get())
            .field("pending_inbound", &self.inbound.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::runtime::timing::{Duration, ManualClock};
    use std::collections::VecDeque;

    /// Engine double: echoes every accepted datagram back as a delivered
    /// payload and rejects datagrams starting with `0xFF`.
    #[derive(Default)]
    struct EchoEngine {
        delivered: VecDeque<Bytes>,
        sent: Vec<Bytes>,
        updates: Vec<u64>,
        outstanding: usize,
        released: usize,
    }

    impl TransportEngine for EchoEngine {
        fn connection_id(&self) -> ConnectionId {
            ConnectionId::new(7)
        }

        fn input(&mut self, datagram: &[u8]) -> Result<(), EngineError> {
            if datagram.first() == Some(&0xFF) {
                return Err(EngineError::Malformed("bad header".into()));
            }
            self.delivered.push_back(Bytes::copy_from_slice(datagram));
            Ok(())
        }

        fn send(&mut self, payload: &[u8]) -> Result<(), EngineError> {
            self.sent.push(Bytes::copy_from_slice(payload));
            Ok(())
        }

        fn update(&mut self, now: Timestamp<Millis>) {
            self.updates.push(now.as_u64());
        }

        fn recv(&mut self) -> Option<Bytes> {
            self.delivered.pop_front()
        }

        fn outstanding_send_count(&self) -> usize {
            self.outstanding
        }

        fn release(&mut self) {
            self.released += 1;
        }
    }

    struct NoRegistry;
    impl SessionRegistry for NoRegistry {
        fn remove(&self, _conv: ConnectionId) {}
    }

    struct NoScheduler;
    impl LoopScheduler for NoScheduler {
        fn register(&self, _session: Arc<dyn ManagedSession>) -> LoopHandle {
            LoopHandle::new(0)
        }
        fn deregister(&self, _conv: ConnectionId) {}
    }

    type Received = Arc<Mutex<Vec<Bytes>>>;

    fn open_echo(
        clock: &Arc<ManualClock>,
    ) -> (
        Arc<Session<EchoEngine, impl PayloadHandler + 'static>>,
        Received,
    ) {
        let received: Received = Arc::default();
        let sink = Arc::clone(&received);
        let handler = move |_ctx: &mut Context<'_>, payload: Bytes| {
            sink.lock().unwrap().push(payload);
        };
        let session = Session::open(
            EchoEngine::default(),
            handler,
            SessionConfig::default(),
            Arc::clone(clock) as Arc<dyn Clock>,
            &Arc::new(NoRegistry),
            &Arc::new(NoScheduler),
        )
        .unwrap();
        (session, received)
    }

    #[test]
    fn tick_ingests_and_delivers_in_order() {
        let clock = Arc::new(ManualClock::new(1_000));
        let (session, received) = open_echo(&clock);

        session.submit_raw(Bytes::from_static(b"one"));
        session.submit_raw(Bytes::from_static(b"two"));
        session.tick();

        assert_eq!(
            *received.lock().unwrap(),
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
        let stats = session.stats();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.datagrams_ingested, 2);
        assert_eq!(stats.payloads_delivered, 2);
        assert_eq!(session.lock_core().engine.updates, vec![1_000]);
    }

    #[test]
    fn rejected_datagram_is_skipped() {
        let clock = Arc::new(ManualClock::new(0));
        let (session, received) = open_echo(&clock);

        session.submit_raw(Bytes::from_static(b"a"));
        session.submit_raw(Bytes::from_static(&[0xFF, 1]));
        session.submit_raw(Bytes::from_static(b"b"));
        session.tick();

        assert!(session.is_open());
        assert_eq!(received.lock().unwrap().len(), 2);
        assert_eq!(session.stats().datagrams_rejected, 1);
    }

    #[test]
    fn send_application_reaches_engine_on_next_tick() {
        let clock = Arc::new(ManualClock::new(0));
        let (session, _received) = open_echo(&clock);

        session.send_application(Bytes::from_static(b"out"));
        assert!(session.lock_core().engine.sent.is_empty());

        session.tick();
        assert_eq!(session.lock_core().engine.sent, vec![Bytes::from_static(b"out")]);
        assert_eq!(session.stats().payloads_sent, 1);
    }

    #[test]
    fn close_releases_once_and_silences_session() {
        let clock = Arc::new(ManualClock::new(0));
        let (session, received) = open_echo(&clock);

        session.close();
        session.close();
        assert_eq!(session.state(), State::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::Requested));
        assert_eq!(session.lock_core().engine.released, 1);

        session.submit_raw(Bytes::from_static(b"late"));
        session.tick();
        assert!(received.lock().unwrap().is_empty());
        assert_eq!(session.stats().ticks, 0);
    }

    #[test]
    fn idle_timeout_is_strict() {
        let clock = Arc::new(ManualClock::new(0));
        let (session, _received) = open_echo(&clock);

        clock.advance(Duration::from_millis(180_000));
        session.tick();
        assert!(session.is_open());

        clock.advance(Duration::from_millis(1));
        session.tick();
        assert!(!session.is_open());
        assert_eq!(
            session.close_reason(),
            Some(CloseReason::IdleTimeout {
                idle: Duration::from_millis(180_001)
            })
        );
    }
}
