//! Shared test doubles: a scripted engine, counting registry and scheduler,
//! and a recording payload handler.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use bytes::Bytes;
use keel::runtime::timing::{Millis, Timestamp};
use keel::{
    Clock, CloseReason, ConnectionId, Context, EngineError, LoopHandle, LoopScheduler,
    ManagedSession, ManualClock, PayloadHandler, Session, SessionConfig, SessionRegistry,
};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(keel::init_tracing);
}

/// Everything the scripted engine saw, plus the knobs a test turns.
#[derive(Debug, Default)]
pub struct EngineLog {
    pub inputs: Vec<Bytes>,
    pub sent: Vec<Bytes>,
    pub updates: Vec<u64>,
    pub releases: usize,
    /// Returned by `recv` in order.
    pub deliver: VecDeque<Bytes>,
    /// Reported by `outstanding_send_count`.
    pub outstanding: usize,
    /// Queue every accepted datagram for delivery.
    pub echo: bool,
    /// Reject every `send`.
    pub reject_sends: bool,
}

pub type Probe = Arc<Mutex<EngineLog>>;

/// Engine double. Datagrams starting with `0xFF` are rejected as malformed.
pub struct ScriptedEngine {
    conv: ConnectionId,
    probe: Probe,
}

impl ScriptedEngine {
    pub fn new(conv: u32) -> (Self, Probe) {
        let probe = Probe::default();
        let engine = Self {
            conv: ConnectionId::new(conv),
            probe: Arc::clone(&probe),
        };
        (engine, probe)
    }

    pub fn echoing(conv: u32) -> (Self, Probe) {
        let (engine, probe) = Self::new(conv);
        probe.lock().unwrap().echo = true;
        (engine, probe)
    }
}

impl keel::TransportEngine for ScriptedEngine {
    fn connection_id(&self) -> ConnectionId {
        self.conv
    }

    fn input(&mut self, datagram: &[u8]) -> Result<(), EngineError> {
        if datagram.first() == Some(&0xFF) {
            return Err(EngineError::Malformed("bad segment header".into()));
        }
        let mut log = self.probe.lock().unwrap();
        let datagram = Bytes::copy_from_slice(datagram);
        if log.echo {
            log.deliver.push_back(datagram.clone());
        }
        log.inputs.push(datagram);
        Ok(())
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), EngineError> {
        let mut log = self.probe.lock().unwrap();
        if log.reject_sends {
            return Err(EngineError::PayloadTooLarge {
                len: payload.len(),
                max: 0,
            });
        }
        log.sent.push(Bytes::copy_from_slice(payload));
        Ok(())
    }

    fn update(&mut self, now: Timestamp<Millis>) {
        self.probe.lock().unwrap().updates.push(now.as_u64());
    }

    fn recv(&mut self) -> Option<Bytes> {
        self.probe.lock().unwrap().deliver.pop_front()
    }

    fn outstanding_send_count(&self) -> usize {
        self.probe.lock().unwrap().outstanding
    }

    fn release(&mut self) {
        self.probe.lock().unwrap().releases += 1;
    }
}

#[derive(Debug, Default)]
pub struct CountingRegistry {
    pub removals: AtomicUsize,
}

impl SessionRegistry for CountingRegistry {
    fn remove(&self, _conv: ConnectionId) {
        self.removals.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scheduler the test drives by hand.
#[derive(Default)]
pub struct ManualScheduler {
    sessions: Mutex<Vec<Arc<dyn ManagedSession>>>,
    pub registrations: AtomicUsize,
    pub deregistrations: AtomicUsize,
}

impl ManualScheduler {
    pub fn tick_all(&self) {
        let sessions = self.sessions.lock().unwrap().clone();
        for session in sessions {
            session.tick();
        }
    }
}

impl LoopScheduler for ManualScheduler {
    fn register(&self, session: Arc<dyn ManagedSession>) -> LoopHandle {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().unwrap().push(session);
        LoopHandle::new(0)
    }

    fn deregister(&self, conv: ConnectionId) {
        self.deregistrations.fetch_add(1, Ordering::SeqCst);
        self.sessions
            .lock()
            .unwrap()
            .retain(|s| s.connection_id() != conv);
    }
}

/// Handler that records payloads and close reasons. Optionally closes the
/// session from inside the handler after `close_after` payloads.
#[derive(Clone, Default)]
pub struct Recorder {
    pub received: Arc<Mutex<Vec<Bytes>>>,
    pub closes: Arc<Mutex<Vec<CloseReason>>>,
    pub close_after: Option<usize>,
    pub reply: Option<Bytes>,
}

impl Recorder {
    pub fn received(&self) -> Vec<Bytes> {
        self.received.lock().unwrap().clone()
    }

    pub fn closes(&self) -> Vec<CloseReason> {
        self.closes.lock().unwrap().clone()
    }
}

impl PayloadHandler for Recorder {
    fn on_payload(&mut self, ctx: &mut Context<'_>, payload: Bytes) {
        let count = {
            let mut received = self.received.lock().unwrap();
            received.push(payload);
            received.len()
        };
        if let Some(reply) = &self.reply {
            ctx.send(reply).unwrap();
        }
        if self.close_after == Some(count) {
            ctx.close();
        }
    }

    fn on_close(&mut self, _conv: ConnectionId, reason: CloseReason) {
        self.closes.lock().unwrap().push(reason);
    }
}

/// A session opened against manual time, a counting registry and a manual
/// scheduler.
pub struct Harness {
    pub session: Arc<Session<ScriptedEngine, Recorder>>,
    pub probe: Probe,
    pub recorder: Recorder,
    pub clock: Arc<ManualClock>,
    pub registry: Arc<CountingRegistry>,
    pub scheduler: Arc<ManualScheduler>,
}

impl Harness {
    pub fn open(config: SessionConfig) -> Self {
        Self::open_with(config, Recorder::default())
    }

    pub fn open_with(config: SessionConfig, recorder: Recorder) -> Self {
        init_tracing();
        let (engine, probe) = ScriptedEngine::new(42);
        let clock = Arc::new(ManualClock::new(0));
        let registry = Arc::new(CountingRegistry::default());
        let scheduler = Arc::new(ManualScheduler::default());
        let session = Session::open(
            engine,
            recorder.clone(),
            config,
            Arc::clone(&clock) as Arc<dyn Clock>,
            &registry,
            &scheduler,
        )
        .unwrap();
        Self {
            session,
            probe,
            recorder,
            clock,
            registry,
            scheduler,
        }
    }

    pub fn log(&self) -> std::sync::MutexGuard<'_, EngineLog> {
        self.probe.lock().unwrap()
    }

    pub fn advance(&self, millis: u64) {
        self.clock
            .advance(keel::runtime::timing::Duration::from_millis(millis));
    }
}

pub fn payloads(items: &[&str]) -> Vec<Bytes> {
    items
        .iter()
        .map(|item| Bytes::copy_from_slice(item.as_bytes()))
        .collect()
}

/// Polls `condition` until it holds or five seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}
