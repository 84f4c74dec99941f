//! Configuration for sessions and the loop group.
//!
//! Both structs deserialize with per-field defaults, so a partial document
//! (or an empty one) yields a usable configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::timing::{Duration, Millis};

/// Idle timeout applied when none is configured: three minutes.
pub const DEFAULT_IDLE_TIMEOUT: Duration<Millis> = Duration::from_millis(3 * 60 * 1000);

/// Outstanding-send ceiling applied when none is configured.
pub const DEFAULT_MAX_OUTSTANDING_SEND: usize = 128;

/// Loop cadence applied when none is configured.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 10;

/// Invalid configuration value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("idle timeout must be greater than zero")]
    ZeroIdleTimeout,
    #[error("outstanding-send ceiling must be greater than zero")]
    ZeroSendCeiling,
    #[error("loop group needs at least one thread")]
    ZeroThreads,
    #[error("tick interval must be greater than zero")]
    ZeroTickInterval,
    #[error("manual CPU placement lists no cores")]
    EmptyCoreList,
}

/// Per-session liveness and backpressure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Close the session after this long without an inbound datagram.
    /// The comparison is strict: exactly the timeout does not close.
    pub idle_timeout: Duration<Millis>,
    /// Close the session once the engine reports more unacknowledged
    /// segments than this. Reaching the ceiling exactly is allowed.
    pub max_outstanding_send: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_outstanding_send: DEFAULT_MAX_OUTSTANDING_SEND,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn with_idle_timeout(mut self, idle_timeout: Duration<Millis>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    #[must_use]
    pub const fn with_max_outstanding_send(mut self, ceiling: usize) -> Self {
        self.max_outstanding_send = ceiling;
        self
    }

    /// # Errors
    ///
    /// Returns an error if either threshold is zero.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::ZeroIdleTimeout);
        }
        if self.max_outstanding_send == 0 {
            return Err(ConfigError::ZeroSendCeiling);
        }
        Ok(())
    }
}

/// Core pinning for loop threads.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuConfig {
    /// Pin one loop per physical core when there are enough of them.
    #[default]
    Auto,
    /// Leave placement to the OS.
    Unpinned,
    /// Pin loop `i` to `cores[i % cores.len()]`.
    Manual(Vec<usize>),
}

/// Loop group sizing and cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopGroupConfig {
    /// Number of loop threads.
    pub threads: usize,
    /// Target interval between two ticks of the same session.
    pub tick_interval_ms: u64,
    /// Thread placement.
    pub cpu: CpuConfig,
    /// Loop threads are named `{prefix}-{index}`.
    pub thread_name_prefix: String,
}

impl Default for LoopGroupConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get().max(1),
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            cpu: CpuConfig::Auto,
            thread_name_prefix: "keel-loop".to_owned(),
        }
    }
}

impl LoopGroupConfig {
    #[must_use]
    pub const fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_interval_ms)
    }

    /// # Errors
    ///
    /// Returns an error for a zero thread count, a zero interval, or an
    /// empty manual core list.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::ZeroTickInterval);
        }
        if matches!(&self.cpu, CpuConfig::Manual(cores) if cores.is_empty()) {
            return Err(ConfigError::EmptyCoreList);
        }
        Ok(())
    }
}
