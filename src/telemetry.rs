//! Logging setup for embedding processes
//!
//! The core only emits `tracing` events; turning them into output is the
//! embedder's job. This helper wires a sensible default subscriber from the
//! configured log level, honoring `RUST_LOG` when set.

use tracing::info;

use crate::config::CoordinatorConfig;

/// Initializes a global `fmt` subscriber from the configuration
///
/// `RUST_LOG` overrides `config.log_level`. Calling this twice is a no-op:
/// the second registration fails quietly rather than panicking, so tests
/// can call it freely.
pub fn init(config: &CoordinatorConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(format!("switchboard={}", config.log_level))
        });
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok();
    if installed {
        info!(log_level = %config.log_level, log_file = %config.log_file, "telemetry initialized");
    }
}
