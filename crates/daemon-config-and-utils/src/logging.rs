//! Logging initialization for the daemon.
//!
//! All daemon components log through `tracing` with structured fields; the
//! subscriber writes human-readable lines to stderr. `RUST_LOG` overrides the
//! configured default level.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging system for the daemon.
///
/// # Arguments
///
/// * `level` - Default log level (trace, debug, info, warn, error)
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    // try_init: tests may install a subscriber more than once.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
