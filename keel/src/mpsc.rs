//! Core MPSC (Multi-Producer Single-Consumer) queue primitives.
//!
//! This module contains an unbounded lock-free MPSC linked queue. Producers
//! never block and never fail; the single consumer polls without blocking.
//!
//! Used by:
//! - [`crate::sync::inbound`] - per-session inbound and outbound queues
//! - [`crate::runtime::loop_group`] - loop thread command queues

pub(crate) mod queue;
