//! Logging for session supervision.
//!
//! Build with `--features tracing` to route events through the `tracing`
//! crate. Without the feature every macro expands to nothing, so the tick
//! hot path carries no logging cost.
//!
//! Every session event carries a `conv` field (the connection id).

/// Installs a global `tracing` subscriber.
///
/// The filter is taken from `RUST_LOG` and falls back to `keel=debug`.
/// Intended for binaries and tests; calling it twice panics inside
/// `tracing-subscriber`, so wrap it in a `Once` in test suites.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("keel=debug"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_thread_ids(true)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

// Arguments are swallowed unevaluated. Call sites must not rely on side
// effects inside log arguments.
#[cfg(not(feature = "tracing"))]
macro_rules! disabled {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {
    disabled as debug, disabled as error, disabled as info, disabled as trace, disabled as warn,
};
