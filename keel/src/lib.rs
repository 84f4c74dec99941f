//! Per-connection supervision for reliable sessions over unreliable
//! datagram transports.
//!
//! A [`Session`] wraps one [`TransportEngine`] (the reliability state
//! machine for a single connection id). Network threads hand it raw
//! datagrams, a [`LoopGroup`] ticks it on a fixed cadence, and a
//! [`PayloadHandler`] receives the payloads the engine reassembles. The
//! session closes itself when the peer goes quiet or the engine's unacked
//! backlog grows past its ceiling, and removes itself from the [`Registry`]
//! and the scheduler exactly once.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use keel::{Context, LoopGroup, LoopGroupConfig, Registry, SessionConfig, SystemClock};
//! # use keel::{ConnectionId, EngineError, TransportEngine};
//! # use keel::runtime::timing::{Millis, Timestamp};
//! # struct MyEngine;
//! # impl TransportEngine for MyEngine {
//! #     fn connection_id(&self) -> ConnectionId { ConnectionId::new(1) }
//! #     fn input(&mut self, _: &[u8]) -> Result<(), EngineError> { Ok(()) }
//! #     fn send(&mut self, _: &[u8]) -> Result<(), EngineError> { Ok(()) }
//! #     fn update(&mut self, _: Timestamp<Millis>) {}
//! #     fn recv(&mut self) -> Option<Bytes> { None }
//! #     fn outstanding_send_count(&self) -> usize { 0 }
//! #     fn release(&mut self) {}
//! # }
//!
//! keel::init_tracing();
//!
//! let loops = Arc::new(LoopGroup::spawn(LoopGroupConfig::default())?);
//! let registry = Arc::new(Registry::new());
//!
//! let echo = |ctx: &mut Context<'_>, payload: Bytes| {
//!     let _ = ctx.send(&payload);
//! };
//! registry.open_session(
//!     MyEngine,
//!     echo,
//!     SessionConfig::default(),
//!     Arc::new(SystemClock),
//!     &loops,
//! )?;
//!
//! // From the network receive path:
//! registry.route(ConnectionId::new(1), Bytes::from_static(b"datagram"));
//!
//! registry.close_all();
//! loops.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod engine;
mod mpsc;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod sync;
mod trace;

pub use config::{ConfigError, CpuConfig, LoopGroupConfig, SessionConfig};
pub use engine::{ConnectionId, EngineError, TransportEngine};
pub use registry::{Registry, RegistryError, SessionRegistry};
pub use runtime::loop_group::{LoopGroup, LoopGroupError, LoopHandle, LoopScheduler};
pub use runtime::timing::{Clock, ManualClock, SystemClock};
pub use session::{
    CloseReason, Context, ManagedSession, PayloadHandler, Session, SessionStats, State,
};
pub use trace::init_tracing;
