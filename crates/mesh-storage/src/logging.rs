//! Structured logging for VectorMesh.
//!
//! Centralized logging configuration using the `tracing` crate. Log levels
//! are configured via the `VMESH_LOG` environment variable.
//!
//! # Environment Variables
//!
//! - `VMESH_LOG=info` - default level
//! - `VMESH_LOG=debug` - verbose logging
//! - `VMESH_LOG=mesh_storage::sharding=debug` - module-specific logging
//! - `VMESH_LOG=warn,mesh_storage::governor=debug` - combined filters
//!
//! # Example
//!
//! ```ignore
//! use mesh_storage::logging;
//!
//! // Initialize once at startup.
//! logging::init();
//! ```

use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global tracing subscriber with default settings.
///
/// Uses the `VMESH_LOG` environment variable for configuration, defaulting
/// to `info`. Subsequent calls are ignored (tracing allows one subscriber).
pub fn init() {
    init_with_default("info");
}

/// Initializes the global tracing subscriber with a custom default level.
pub fn init_with_default(default_level: &str) {
    let filter =
        EnvFilter::try_from_env("VMESH_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let _ = subscriber.try_init();
}

/// Initializes logging with JSON output for log aggregators.
pub fn init_json() {
    let filter = EnvFilter::try_from_env("VMESH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt().with_env_filter(filter).with_target(true).json();

    let _ = subscriber.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_does_not_panic() {
        init();
        init();
        init_with_default("warn");
    }
}
