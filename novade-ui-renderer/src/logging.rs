//! `tracing` subscriber setup for hosts and tests.
//!
//! The renderer itself only emits events; installing a subscriber is left to
//! the embedding application. These helpers cover the common cases.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Installs a stderr subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Errors (e.g. a global subscriber already being set) are ignored.
pub fn init_minimal_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Installs a stderr subscriber at a fixed level. Vulkan validation output is
/// emitted under the `vulkan` target and follows the same level.
pub fn init_logging(level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();
}
