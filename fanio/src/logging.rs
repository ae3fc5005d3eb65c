//! Structured logging initialization.
//!
//! The runtime itself only emits `tracing` events; installing a subscriber is
//! the application's choice. This helper wires up a reasonable fmt subscriber,
//! with the `RUST_LOG` environment variable taking precedence over the
//! configured minimum level.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a global fmt subscriber filtered at `min_level` (or `RUST_LOG`).
///
/// Safe to call more than once; subsequent calls are no-ops because a global
/// subscriber can only be set once per process.
pub fn init(min_level: tracing::Level) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(min_level.to_string())
    };

    let _ = fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
