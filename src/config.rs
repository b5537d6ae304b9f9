//! Coordinator configuration
//!
//! Provides the enumerated configuration surface with environment-variable
//! loading, validation, and a testing preset used by the test suite.

use serde::{Deserialize, Serialize};
use std::env;

use crate::error::{CoordinationError, Result};

/// Complete configuration for a coordinator instance
///
/// `server_host`/`server_port`, `log_level`, and `log_file` are carried for
/// the embedding process (serving layer, subscriber setup) and are not
/// interpreted by core logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Serving-layer bind host (not interpreted by the core)
    pub server_host: String,
    /// Serving-layer bind port (not interpreted by the core)
    pub server_port: u16,
    /// Hard cap on registered agents; registration beyond it fails
    pub max_agents: usize,
    /// Hard cap on concurrent connections (enforced by the serving layer)
    pub max_connections: usize,
    /// Per-identifier admission budget over a sliding minute
    pub rate_limit_per_minute: usize,
    /// Maximum serialized message content size in bytes
    pub max_message_size: usize,
    /// When false, the HITL middleware is a pass-through
    pub hitl_enabled: bool,
    /// Default approval deadline in seconds; `0` means no deadline
    pub hitl_timeout_seconds: u64,
    /// Gates instantiation of the federated aggregator
    pub frl_enabled: bool,
    /// Minimum seconds between aggregations per agent
    pub frl_aggregation_interval: u64,
    /// Log emission level (not interpreted by core logic)
    pub log_level: String,
    /// Log file path (not interpreted by core logic)
    pub log_file: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            server_host: "localhost".to_string(),
            server_port: 8000,
            max_agents: 1000,
            max_connections: 10_000,
            rate_limit_per_minute: 60,
            max_message_size: 1_048_576,
            hitl_enabled: true,
            hitl_timeout_seconds: 3600,
            frl_enabled: false,
            frl_aggregation_interval: 3600,
            log_level: "info".to_string(),
            log_file: "switchboard.log".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Loads configuration from the environment, falling back to defaults
    /// for absent or unparseable values
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_host: env_string("SERVER_HOST", defaults.server_host),
            server_port: env_parsed("SERVER_PORT", defaults.server_port),
            max_agents: env_parsed("MAX_AGENTS", defaults.max_agents),
            max_connections: env_parsed("MAX_CONNECTIONS", defaults.max_connections),
            rate_limit_per_minute: env_parsed(
                "RATE_LIMIT_PER_MINUTE",
                defaults.rate_limit_per_minute,
            ),
            max_message_size: env_parsed("MAX_MESSAGE_SIZE", defaults.max_message_size),
            hitl_enabled: env_parsed("HITL_ENABLED", defaults.hitl_enabled),
            hitl_timeout_seconds: env_parsed(
                "HITL_TIMEOUT_SECONDS",
                defaults.hitl_timeout_seconds,
            ),
            frl_enabled: env_parsed("FRL_ENABLED", defaults.frl_enabled),
            frl_aggregation_interval: env_parsed(
                "FRL_AGGREGATION_INTERVAL",
                defaults.frl_aggregation_interval,
            ),
            log_level: env_string("LOG_LEVEL", defaults.log_level),
            log_file: env_string("LOG_FILE", defaults.log_file),
        }
    }

    /// Configuration preset for tests: short approval deadlines, federation
    /// on, and generous admission budgets
    #[must_use]
    pub fn testing() -> Self {
        Self {
            hitl_timeout_seconds: 60,
            frl_enabled: true,
            frl_aggregation_interval: 0,
            rate_limit_per_minute: 10_000,
            ..Self::default()
        }
    }

    /// Validates cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `InvalidParams` when a cap is zero or the message size bound
    /// is too small to carry a JSON envelope.
    pub fn validate(&self) -> Result<()> {
        if self.max_agents == 0 {
            return Err(CoordinationError::InvalidParams {
                reason: "max_agents must be positive".into(),
            });
        }
        if self.max_connections == 0 {
            return Err(CoordinationError::InvalidParams {
                reason: "max_connections must be positive".into(),
            });
        }
        if self.max_message_size < 64 {
            return Err(CoordinationError::InvalidParams {
                reason: "max_message_size must be at least 64 bytes".into(),
            });
        }
        Ok(())
    }
}

fn env_string(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
