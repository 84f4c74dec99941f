//! Session registry keyed by connection id.
//!
//! Sessions only ever call [`SessionRegistry::remove`] on their registry, so
//! any keyed store can stand in. [`Registry`] is the concurrent map used when
//! nothing else is supplied. It also routes inbound datagrams to sessions.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

use crate::config::{ConfigError, SessionConfig};
use crate::engine::{ConnectionId, TransportEngine};
use crate::runtime::loop_group::LoopScheduler;
use crate::runtime::timing::Clock;
use crate::session::{ManagedSession, PayloadHandler, Session};
use crate::trace::{debug, trace};

/// What a session needs from the store that tracks it.
pub trait SessionRegistry: Send + Sync {
    /// Forgets the session for `conv`. Called once, by the close winner,
    /// after the session reports closed.
    fn remove(&self, conv: ConnectionId);
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} already has a session")]
    Occupied(ConnectionId),
    #[error("invalid session config: {0}")]
    Config(#[from] ConfigError),
}

/// Concurrent map of open sessions.
///
/// Methods that call into a session (`route`, `close_all`) clone the session
/// out of the map first. A session closing removes itself from this map, so
/// calling into it while holding a map guard would deadlock.
#[derive(Default)]
pub struct Registry {
    sessions: DashMap<ConnectionId, Arc<dyn ManagedSession>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session around `engine` and records it under the engine's
    /// connection id.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Occupied`] if the id is already taken (the engine and
    /// handler are dropped, nothing is registered with the scheduler), or
    /// [`RegistryError::Config`] if `config` is invalid.
    pub fn open_session<E, H, S>(
        self: &Arc<Self>,
        engine: E,
        handler: H,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
        scheduler: &Arc<S>,
    ) -> Result<Arc<Session<E, H>>, RegistryError>
    where
        E: TransportEngine + 'static,
        H: PayloadHandler + 'static,
        S: LoopScheduler + 'static,
    {
        let conv = engine.connection_id();
        match self.sessions.entry(conv) {
            Entry::Occupied(_) => Err(RegistryError::Occupied(conv)),
            Entry::Vacant(slot) => {
                let session = Session::open(engine, handler, config, clock, self, scheduler)?;
                slot.insert(Arc::clone(&session) as Arc<dyn ManagedSession>);
                debug!(conv = %conv, "session registered");
                Ok(session)
            }
        }
    }

    /// Records an already-open session.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Occupied`] if the id is already taken.
    pub fn insert(&self, session: Arc<dyn ManagedSession>) -> Result<(), RegistryError> {
        let conv = session.connection_id();
        match self.sessions.entry(conv) {
            Entry::Occupied(_) => Err(RegistryError::Occupied(conv)),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn get(&self, conv: ConnectionId) -> Option<Arc<dyn ManagedSession>> {
        self.sessions.get(&conv).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes and returns the session for `conv` without closing it.
    pub fn take(&self, conv: ConnectionId) -> Option<Arc<dyn ManagedSession>> {
        self.sessions.remove(&conv).map(|(_, session)| session)
    }

    #[must_use]
    pub fn contains(&self, conv: ConnectionId) -> bool {
        self.sessions.contains_key(&conv)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Hands `datagram` to the session for `conv`. Returns `false` when no
    /// session is registered under that id.
    pub fn route(&self, conv: ConnectionId, datagram: Bytes) -> bool {
        let Some(session) = self.get(conv) else {
            trace!(conv = %conv, len = datagram.len(), "no session for datagram");
            return false;
        };
        session.submit_raw(datagram);
        true
    }

    /// Closes every registered session. Each close removes its own entry.
    pub fn close_all(&self) {
        let sessions: Vec<Arc<dyn ManagedSession>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        debug!(count = sessions.len(), "closing all sessions");
        for session in sessions {
            session.close();
        }
    }
}

impl SessionRegistry for Registry {
    /// Drops the entry only if it holds a closed session. The close winner
    /// flips state before calling this, so an open successor that reused
    /// `conv` stays reachable.
    fn remove(&self, conv: ConnectionId) {
        self.sessions.remove_if(&conv, |_, session| !session.is_open());
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
