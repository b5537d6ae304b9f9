//! Error taxonomy for the coordination core
//!
//! Every externally-visible failure maps to one of the variants below. Each
//! variant carries a stable `kind` string that survives the JSON-RPC
//! boundary, so callers can branch on failure class without parsing
//! human-readable messages.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// An identifier did not resolve to a known record
    #[error("not found: {entity} {id}")]
    NotFound {
        /// Record class (agent, manifest, task, approval, workflow)
        entity: &'static str,
        /// The identifier that failed to resolve
        id: String,
    },

    /// Registration collided with an existing identifier or DID
    #[error("duplicate identifier: {id}")]
    DuplicateIdentifier {
        /// The colliding identifier
        id: String,
    },

    /// The operation is not legal from the record's current state
    #[error("invalid state: {reason}")]
    InvalidState {
        /// Why the transition was refused
        reason: String,
    },

    /// An inbound request violated a parameter schema
    #[error("invalid params: {reason}")]
    InvalidParams {
        /// Which constraint was violated
        reason: String,
    },

    /// The router found no target for the message
    #[error("no route: {reason}")]
    NoRoute {
        /// Why no target was selected
        reason: String,
    },

    /// A caller exceeded its admission budget or a hard cap
    #[error("rate limited: {reason}")]
    RateLimited {
        /// Which budget was exhausted
        reason: String,
    },

    /// A human operator rejected the gated message
    #[error("approval rejected: {reason}")]
    ApprovalRejected {
        /// Operator-supplied rejection reason
        reason: String,
    },

    /// The approval deadline passed without an operator decision
    #[error("approval expired")]
    ApprovalExpired,

    /// An external call failed in a way that is safe to retry
    #[error("transient failure: {reason}")]
    Transient {
        /// What failed
        reason: String,
    },

    /// An invariant was violated; the operation must be aborted
    #[error("fatal: {reason}")]
    Fatal {
        /// The violated invariant
        reason: String,
    },
}

impl CoordinationError {
    /// Stable machine-readable failure class
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::DuplicateIdentifier { .. } => "duplicate_identifier",
            Self::InvalidState { .. } => "invalid_state",
            Self::InvalidParams { .. } => "invalid_params",
            Self::NoRoute { .. } => "no_route",
            Self::RateLimited { .. } => "rate_limited",
            Self::ApprovalRejected { .. } => "approval_rejected",
            Self::ApprovalExpired => "approval_expired",
            Self::Transient { .. } => "transient",
            Self::Fatal { .. } => "fatal",
        }
    }

    /// JSON-RPC 2.0 error code for this failure class
    ///
    /// `InvalidParams` maps to the standard -32602, `Fatal` to the
    /// internal error -32603, and the domain failures to the server-defined
    /// -32000 with `kind` carried in the error data.
    #[must_use]
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            Self::InvalidParams { .. } => -32602,
            Self::Fatal { .. } => -32603,
            _ => -32000,
        }
    }

    /// Whether the failure is safe to retry at the point of origin
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Convenience constructor for lookups that missed
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidParams {
            reason: err.to_string(),
        }
    }
}

impl From<std::io::Error> for CoordinationError {
    fn from(err: std::io::Error) -> Self {
        Self::Transient {
            reason: err.to_string(),
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Maximum retry attempts for transient failures
const MAX_ATTEMPTS: u32 = 3;
/// Base backoff before the first retry
const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Runs `op`, retrying transient failures with exponential backoff
///
/// Up to three attempts, doubling the delay each time with ±20% jitter.
/// A transient error that survives all attempts is promoted to `Fatal`;
/// non-transient errors propagate unchanged on first occurrence.
pub async fn retry_transient<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(CoordinationError::Fatal {
                        reason: format!("retries exhausted: {err}"),
                    });
                }
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE.as_millis() as f64 * f64::from(2_u32.pow(attempt - 1));
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((base * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            CoordinationError::not_found("agent", "u1").kind(),
            "not_found"
        );
        assert_eq!(CoordinationError::ApprovalExpired.kind(), "approval_expired");
    }

    #[test]
    fn jsonrpc_codes_follow_the_taxonomy() {
        assert_eq!(
            CoordinationError::InvalidParams {
                reason: "bad".into()
            }
            .jsonrpc_code(),
            -32602
        );
        assert_eq!(
            CoordinationError::Fatal {
                reason: "broken".into()
            }
            .jsonrpc_code(),
            -32603
        );
        assert_eq!(
            CoordinationError::NoRoute {
                reason: "none".into()
            }
            .jsonrpc_code(),
            -32000
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_then_promoted() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(CoordinationError::Transient {
                    reason: "flaky".into(),
                })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(CoordinationError::Fatal { .. })));
    }

    #[tokio::test]
    async fn non_transient_failures_propagate_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(CoordinationError::not_found("task", "t1"))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(CoordinationError::NotFound { .. })));
    }
}
