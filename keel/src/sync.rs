//! Synchronization primitives for in-process communication.
//!
//! This module provides the thread-safe queues sessions and loop threads
//! use to hand work across threads.

pub mod inbound;
