//! Logging initialization for etude.
//!
//! The engine logs through `tracing`; nothing is printed until a subscriber
//! is installed with one of these functions.
//!
//! ## Configuration
//!
//! The level can be controlled with the `RUST_LOG` environment variable,
//! which always wins over the level passed in code:
//!
//! ```bash
//! # Accepts, closes and ignored headers
//! RUST_LOG=debug etude
//!
//! # Only refused connections, overflows and failures
//! RUST_LOG=warn etude
//!
//! # Fine-grained control
//! RUST_LOG=etude_core::reactor=debug,etude_core::parser=info etude
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging at `info`.
///
/// # Panics
///
/// Panics if a global subscriber is already installed. Call it once at
/// startup.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging with a default level, e.g. `"debug"` or `"warn"`.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Initialize JSON-formatted logging, one object per line, for log
/// aggregation.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_json(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_thread_names(true))
        .init();
}
