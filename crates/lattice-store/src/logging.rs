//! Structured logging setup.
//!
//! Centralized `tracing` configuration. The filter comes from the
//! `LATTICE_LOG` environment variable:
//!
//! - `LATTICE_LOG=info` - default level
//! - `LATTICE_LOG=debug` - verbose logging
//! - `LATTICE_LOG=lattice_store::transfer=debug` - module-specific logging
//! - `LATTICE_LOG=warn,lattice_store::coordinator=debug` - combined filters

use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global tracing subscriber with default settings.
///
/// Call once at startup; later calls are ignored.
pub fn init() {
    init_with_default("info");
}

/// Initializes the global tracing subscriber with a custom default level,
/// used when `LATTICE_LOG` is unset.
pub fn init_with_default(default_level: &str) {
    let filter =
        EnvFilter::try_from_env("LATTICE_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let _ = subscriber.try_init();
}

/// Initializes logging with JSON output, for log-aggregated deployments.
pub fn init_json() {
    let filter = EnvFilter::try_from_env("LATTICE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt().with_env_filter(filter).with_target(true).json();

    let _ = subscriber.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        init_with_default("warn");
    }
}
