//! Loop threads that tick sessions on a fixed cadence.
//!
//! # Architecture
//!
//! ```text
//!  register ──round robin──▶ loop-0 command queue ──▶ loop-0: { conv → session }
//!                          ▶ loop-1 command queue ──▶ loop-1: { conv → session }
//!  deregister ──broadcast──▶ every command queue
//! ```
//!
//! Each loop thread owns its session table outright. Registration and
//! deregistration travel over the loop's lock-free command queue, so neither
//! waits for a tick in progress, and a session may deregister itself from
//! inside its own tick.
//!
//! A loop iteration applies pending commands, ticks every session once,
//! drops sessions that are no longer open, then sleeps until the next
//! cadence deadline. A loop that falls behind skips the missed deadlines
//! instead of ticking in a burst.
//!
//! Shutdown stops the loops; it does not close sessions. Close them first
//! (for example with [`Registry::close_all`](crate::registry::Registry::close_all)).

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use crate::config::{ConfigError, LoopGroupConfig};
use crate::engine::ConnectionId;
use crate::runtime::topology::{self, pin_to_core};
use crate::session::ManagedSession;
use crate::sync::inbound::{self, Consumer, Producer};
use crate::trace::{debug, error, info, warn};

/// What a session needs from whatever drives its ticks.
pub trait LoopScheduler: Send + Sync {
    /// Assigns `session` to a loop. The loop starts ticking it from its next
    /// iteration.
    fn register(&self, session: Arc<dyn ManagedSession>) -> LoopHandle;

    /// Stops ticking the closed session for `conv`. Must not block on a tick:
    /// sessions call this from inside their own tick.
    fn deregister(&self, conv: ConnectionId);
}

/// Loop a session was assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopHandle {
    index: usize,
}

impl LoopHandle {
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self { index }
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.index
    }
}

impl fmt::Display for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop-{}", self.index)
    }
}

/// Error spawning the loop group.
#[derive(Debug, Error)]
pub enum LoopGroupError {
    #[error("invalid loop group config: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to spawn loop thread {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },
}

enum LoopCommand {
    Register(Arc<dyn ManagedSession>),
    Deregister(ConnectionId),
}

/// Group-side view of one loop thread.
struct LoopShared {
    commands: Producer<LoopCommand>,
    /// Sessions owned by the loop as of its last iteration.
    sessions: Arc<AtomicUsize>,
}

/// Handle to a running set of loop threads.
///
/// Dropping the group signals shutdown but does not wait for threads to
/// exit. Use [`LoopGroup::shutdown`] for a joined shutdown.
pub struct LoopGroup {
    loops: Vec<LoopShared>,
    next: AtomicUsize,
    shutdown_flag: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    tick_interval: Duration,
}

impl LoopGroup {
    /// Validates `config` and spawns its loop threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or a thread cannot be
    /// spawned. Threads already started are stopped and joined first.
    pub fn spawn(config: LoopGroupConfig) -> Result<Self, LoopGroupError> {
        config.validate()?;

        let placement = topology::resolve(&config.cpu, config.threads);
        info!(
            threads = config.threads,
            tick_interval_ms = config.tick_interval_ms,
            placement = %placement.strategy,
            "loop group starting"
        );

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let tick_interval = config.tick_interval();
        let mut loops = Vec::with_capacity(config.threads);
        let mut handles = Vec::with_capacity(config.threads);

        for index in 0..config.threads {
            let (commands, command_rx) = inbound::channel();
            let sessions = Arc::new(AtomicUsize::new(0));
            let mut worker = LoopThread {
                index,
                commands: command_rx,
                sessions: HashMap::new(),
                session_count: Arc::clone(&sessions),
                tick_interval,
                shutdown_flag: Arc::clone(&shutdown_flag),
                core: placement.core_for(index),
            };

            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name_prefix))
                .spawn(move || {
                    debug!(loop_index = index, "loop thread started");
                    worker.run();
                    debug!(loop_index = index, "loop thread exiting");
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    error!(loop_index = index, error = %source, "failed to spawn loop thread");
                    shutdown_flag.store(true, Ordering::Release);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(LoopGroupError::Spawn { index, source });
                }
            }
            loops.push(LoopShared { commands, sessions });
        }

        Ok(Self {
            loops,
            next: AtomicUsize::new(0),
            shutdown_flag,
            handles: Mutex::new(handles),
            tick_interval,
        })
    }

    /// Number of loop threads.
    #[must_use]
    pub fn loops(&self) -> usize {
        self.loops.len()
    }

    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Sessions owned by each loop as of its last iteration.
    #[must_use]
    pub fn sessions_per_loop(&self) -> Vec<usize> {
        self.loops
            .iter()
            .map(|l| l.sessions.load(Ordering::Acquire))
            .collect()
    }

    /// Total sessions owned by all loops as of their last iterations.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions_per_loop().into_iter().sum()
    }

    /// Stops every loop thread and waits for it to exit. Idempotent.
    ///
    /// Safe to call from a loop thread; that thread is signalled but not
    /// joined.
    pub fn shutdown(&self) {
        info!("loop group shutdown initiated");
        self.shutdown_flag.store(true, Ordering::Release);

        let handles =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("loop thread panicked");
            }
        }

        info!("loop group shutdown complete");
    }

    /// Returns a clone of the shutdown flag for external signal handling.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }
}

impl LoopScheduler for LoopGroup {
    fn register(&self, session: Arc<dyn ManagedSession>) -> LoopHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[index]
            .commands
            .push(LoopCommand::Register(session));
        LoopHandle::new(index)
    }

    fn deregister(&self, conv: ConnectionId) {
        // Broadcast: a loop only drops the entry if that session is closed,
        // so a newer open session reusing `conv` is left alone.
        for l in &self.loops {
            l.commands.push(LoopCommand::Deregister(conv));
        }
    }
}

impl Drop for LoopGroup {
    fn drop(&mut self) {
        // Signal only. This can run on a loop thread (a session upgrading its
        // weak scheduler reference), which must not join itself.
        self.shutdown_flag.store(true, Ordering::Release);
    }
}

impl fmt::Debug for LoopGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopGroup")
            .field("loops", &self.loops.len())
            .field("tick_interval", &self.tick_interval)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

/// Loop thread state and event loop.
struct LoopThread {
    index: usize,
    commands: Consumer<LoopCommand>,
    sessions: HashMap<ConnectionId, Arc<dyn ManagedSession>>,
    session_count: Arc<AtomicUsize>,
    tick_interval: Duration,
    shutdown_flag: Arc<AtomicBool>,
    core: Option<usize>,
}

impl LoopThread {
    fn run(&mut self) {
        if let Some(core) = self.core {
            if pin_to_core(core) {
                debug!(loop_index = self.index, core, "loop thread pinned");
            } else {
                warn!(loop_index = self.index, core, "failed to pin loop thread");
            }
        }

        let mut deadline = Instant::now();
        while !self.shutdown_flag.load(Ordering::Acquire) {
            self.apply_commands();
            self.tick_sessions();

            deadline = deadline + self.tick_interval;
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            } else {
                deadline = now;
            }
        }
    }

    fn apply_commands(&mut self) {
        while let Some(command) = self.commands.pop() {
            match command {
                LoopCommand::Register(session) => {
                    let conv = session.connection_id();
                    if let Some(previous) = self.sessions.insert(conv, session)
                        && previous.is_open()
                    {
                        warn!(loop_index = self.index, conv = %conv, "replaced an open session");
                    }
                }
                LoopCommand::Deregister(conv) => {
                    if self.sessions.get(&conv).is_some_and(|s| !s.is_open()) {
                        self.sessions.remove(&conv);
                    }
                }
            }
        }
    }

    fn tick_sessions(&mut self) {
        for session in self.sessions.values() {
            let ticked = panic::catch_unwind(AssertUnwindSafe(|| session.tick()));
            if ticked.is_err() {
                error!(
                    loop_index = self.index,
                    conv = %session.connection_id(),
                    "session tick panicked, closing session"
                );
                session.close();
            }
        }
        self.sessions.retain(|_, session| session.is_open());
        self.session_count
            .store(self.sessions.len(), Ordering::Release);
    }
}
