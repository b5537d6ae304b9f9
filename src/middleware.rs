//! Ingress middleware
//!
//! Admission checks applied before a message reaches the router: a sliding
//! one-minute rate window per identifier and a serialized-size bound on
//! message content.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{CoordinationError, Result};
use crate::message::Message;

/// Width of the rate-limiting window
const WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window rate limiter keyed by caller identifier
pub struct RateLimiter {
    requests_per_minute: usize,
    windows: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter admitting `requests_per_minute` per identifier
    #[must_use]
    pub fn new(requests_per_minute: usize) -> Self {
        Self {
            requests_per_minute,
            windows: DashMap::new(),
        }
    }

    /// Admits or refuses one request for `identifier`
    ///
    /// # Errors
    ///
    /// `RateLimited` when the identifier has exhausted its window.
    pub fn check(&self, identifier: &str) -> Result<()> {
        let now = Instant::now();
        let mut window = self.windows.entry(identifier.to_string()).or_default();
        while window
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) > WINDOW)
        {
            window.pop_front();
        }
        if window.len() >= self.requests_per_minute {
            debug!(identifier, "rate limit exceeded");
            return Err(CoordinationError::RateLimited {
                reason: format!("{identifier} exceeded {} requests/minute", self.requests_per_minute),
            });
        }
        window.push_back(now);
        Ok(())
    }
}

/// Rejects messages whose serialized content exceeds `max_bytes`
///
/// # Errors
///
/// `InvalidParams` when the content is too large.
pub fn enforce_message_size(message: &Message, max_bytes: usize) -> Result<()> {
    let size = serde_json::to_vec(&message.content)
        .map(|bytes| bytes.len())
        .unwrap_or(usize::MAX);
    if size > max_bytes {
        return Err(CoordinationError::InvalidParams {
            reason: format!("message content is {size} bytes (max {max_bytes})"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::AgentId;
    use serde_json::json;

    #[test]
    fn limiter_admits_up_to_the_budget() {
        let limiter = RateLimiter::new(3);
        for _ in 0..3 {
            limiter.check("u1").unwrap();
        }
        assert!(matches!(
            limiter.check("u1"),
            Err(CoordinationError::RateLimited { .. })
        ));
        // Budgets are per identifier.
        limiter.check("u2").unwrap();
    }

    #[test]
    fn oversized_content_is_rejected() {
        let message = Message::new(
            AgentId::try_new("u0".to_string()).unwrap(),
            json!("x".repeat(256)),
        );
        assert!(enforce_message_size(&message, 1024).is_ok());
        assert!(matches!(
            enforce_message_size(&message, 64),
            Err(CoordinationError::InvalidParams { .. })
        ));
    }
}
