//! Protocol router
//!
//! Detects which protocol an inbound message belongs to, converts between
//! wire shapes, and forwards frames to the registered protocol handler.
//! Conversion is pure: sender, receiver, content, type, and metadata are
//! preserved, minus each protocol's reserved keys.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{CoordinationError, Result};
use crate::message::{METHOD_KEY, Message};
use crate::protocols::jsonrpc::JsonRpcEngine;

/// Metadata key carrying an explicit protocol hint
pub const PROTOCOL_KEY: &str = "protocol";

/// Protocols the router can translate between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// JSON-RPC 2.0 request/response
    Jsonrpc,
    /// A2A task protocol (shares the JSON-RPC wire shape)
    A2a,
    /// Flat internal dictionary
    Internal,
}

/// A handler accepting frames for one protocol
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Handles a frame; `None` means the frame produced no reply
    async fn handle(&self, frame: Value) -> Result<Option<Value>>;
}

/// Adapter mounting a [`JsonRpcEngine`] as a protocol handler
pub struct JsonRpcProtocolHandler {
    engine: Arc<JsonRpcEngine>,
}

impl JsonRpcProtocolHandler {
    /// Wraps an engine
    #[must_use]
    pub fn new(engine: Arc<JsonRpcEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ProtocolHandler for JsonRpcProtocolHandler {
    async fn handle(&self, frame: Value) -> Result<Option<Value>> {
        let reply = self.engine.handle_value(frame).await;
        let value = reply.to_value();
        Ok((!value.is_null()).then_some(value))
    }
}

/// Routes messages between protocols
#[derive(Default)]
pub struct ProtocolRouter {
    handlers: DashMap<ProtocolKind, Arc<dyn ProtocolHandler>>,
}

impl ProtocolRouter {
    /// Creates a router with no handlers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `protocol`, replacing any prior one
    pub fn register_handler(&self, protocol: ProtocolKind, handler: Arc<dyn ProtocolHandler>) {
        debug!(?protocol, "registered protocol handler");
        self.handlers.insert(protocol, handler);
    }

    /// The handler registered for `protocol`
    #[must_use]
    pub fn get_handler(&self, protocol: ProtocolKind) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers
            .get(&protocol)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Detects the source protocol of a message
    ///
    /// Precedence: an explicit `protocol` metadata hint, then a JSON-RPC id
    /// (JSON-RPC), then a task id (A2A), then internal.
    #[must_use]
    pub fn detect(&self, message: &Message) -> ProtocolKind {
        if let Some(hint) = message.metadata.get(PROTOCOL_KEY) {
            if let Ok(protocol) = serde_json::from_value::<ProtocolKind>(hint.clone()) {
                return protocol;
            }
            warn!(?hint, "unrecognized protocol hint; falling back to detection");
        }
        if message.jsonrpc_id.is_some() {
            return ProtocolKind::Jsonrpc;
        }
        if message.task_id.is_some() {
            return ProtocolKind::A2a;
        }
        ProtocolKind::Internal
    }

    /// Converts and forwards a message to its (detected or given) protocol
    ///
    /// # Errors
    ///
    /// `NoRoute` when no handler is registered for the target protocol.
    pub async fn route(&self, message: &Message, target: Option<ProtocolKind>) -> Result<Option<Value>> {
        let protocol = target.unwrap_or_else(|| self.detect(message));
        let handler = self.get_handler(protocol).ok_or_else(|| {
            CoordinationError::NoRoute {
                reason: format!("no handler registered for protocol {protocol:?}"),
            }
        })?;
        handler.handle(Self::convert(message, protocol)).await
    }

    /// Pure conversion of a message to a protocol's wire shape
    ///
    /// JSON-RPC and A2A share the request envelope; internal is the flat
    /// message dictionary. Unknown metadata rides along in both directions;
    /// the reserved `protocol` hint is stripped.
    #[must_use]
    pub fn convert(message: &Message, target: ProtocolKind) -> Value {
        let mut stripped = message.clone();
        stripped.metadata.remove(PROTOCOL_KEY);
        match target {
            ProtocolKind::Jsonrpc | ProtocolKind::A2a => stripped.to_jsonrpc(),
            ProtocolKind::Internal => {
                serde_json::to_value(&stripped).unwrap_or(Value::Null)
            }
        }
    }
}
