//! Message data model
//!
//! Messages are value-typed and move between components; only the receiving
//! subsystem mutates one (to set the routed receiver or attach a task id).
//! The JSON-RPC wire shape is shared with the A2A protocol: a message
//! becomes a `message/send` request (or whatever its `method` metadata
//! names) and converts back losslessly apart from the reserved `method`
//! metadata key.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::domain_types::{AgentId, CorrelationId, Did, MessageId, TaskId, Timestamp};
use crate::error::{CoordinationError, Result};

/// Metadata key reserved for the JSON-RPC method name
pub const METHOD_KEY: &str = "method";
/// Default method used when converting a message to the wire shape
const DEFAULT_METHOD: &str = "message/send";

/// Message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Plain text exchange
    Text,
    /// A2A task payload
    Task,
    /// Reply to an earlier message
    Response,
    /// Broadcast-style notification
    Notification,
    /// Question expecting an answer
    Query,
    /// Imperative instruction
    Command,
    /// Raw JSON-RPC frame carried as a message
    Jsonrpc,
}

impl MessageType {
    /// Whether the type requires a traceable (non-empty) sender
    #[must_use]
    pub fn requires_sender(&self) -> bool {
        !matches!(self, Self::Notification)
    }
}

/// Message priority; the ordering is total (`Low < Normal < High < Urgent`)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessagePriority {
    /// Background work
    Low = 1,
    /// Default priority
    Normal = 2,
    /// Ahead of normal traffic
    High = 3,
    /// Front of every queue
    Urgent = 4,
}

impl Default for MessagePriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl From<MessagePriority> for u8 {
    fn from(priority: MessagePriority) -> Self {
        priority as u8
    }
}

impl TryFrom<u8> for MessagePriority {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Low),
            2 => Ok(Self::Normal),
            3 => Ok(Self::High),
            4 => Ok(Self::Urgent),
            other => Err(format!("priority out of range: {other}")),
        }
    }
}

impl MessagePriority {
    /// Clamps an arbitrary integer into the `[Low, Urgent]` range
    #[must_use]
    pub fn clamped(value: i64) -> Self {
        match value {
            i64::MIN..=1 => Self::Low,
            2 => Self::Normal,
            3 => Self::High,
            _ => Self::Urgent,
        }
    }
}

/// A routable message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier
    pub id: MessageId,
    /// JSON-RPC request id, when the message arrived over JSON-RPC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc_id: Option<Value>,
    /// Sender identifier; empty only for untraceable notification types
    pub sender_id: Option<AgentId>,
    /// Sender DID, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_did: Option<Did>,
    /// Receiver identifier; set at ingress or by the router
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<AgentId>,
    /// Receiver DID, populated from the registry at dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_did: Option<Did>,
    /// Opaque content payload
    pub content: Value,
    /// Message type
    pub message_type: MessageType,
    /// Priority
    pub priority: MessagePriority,
    /// Free-form metadata mapping
    pub metadata: Map<String, Value>,
    /// Creation time
    pub timestamp: Timestamp,
    /// Whether the content is encrypted (passthrough flag)
    pub encrypted: bool,
    /// Detached signature; presence means the serving layer verified it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Whether the message must pass HITL approval
    pub requires_approval: bool,
    /// Task identifier, once the A2A engine has accepted the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Correlation identifier for threading
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl Message {
    /// Creates a text message from `sender` addressed to nobody in particular
    #[must_use]
    pub fn new(sender: AgentId, content: Value) -> Self {
        Self {
            id: MessageId::generate(),
            jsonrpc_id: None,
            sender_id: Some(sender),
            sender_did: None,
            receiver_id: None,
            receiver_did: None,
            content,
            message_type: MessageType::Text,
            priority: MessagePriority::Normal,
            metadata: Map::new(),
            timestamp: Timestamp::now(),
            encrypted: false,
            signature: None,
            requires_approval: false,
            task_id: None,
            correlation_id: None,
        }
    }

    /// Addresses the message to `receiver`
    #[must_use]
    pub fn to(mut self, receiver: AgentId) -> Self {
        self.receiver_id = Some(receiver);
        self
    }

    /// Sets the message type
    #[must_use]
    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    /// Sets the priority
    #[must_use]
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Inserts a metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Flags the message for HITL approval
    #[must_use]
    pub fn needing_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Whether any approval gate applies: the explicit flag, or the
    /// `sensitive_transaction` / `requires_approval` metadata markers
    #[must_use]
    pub fn is_gated(&self) -> bool {
        if self.requires_approval {
            return true;
        }
        ["sensitive_transaction", "requires_approval"]
            .iter()
            .any(|key| truthy(self.metadata.get(*key)))
    }

    /// Validates the traceability invariant: non-notification types carry a
    /// sender
    ///
    /// # Errors
    ///
    /// Returns `InvalidParams` when the sender is missing.
    pub fn validate(&self) -> Result<()> {
        if self.message_type.requires_sender() && self.sender_id.is_none() {
            return Err(CoordinationError::InvalidParams {
                reason: format!("{:?} messages require a sender", self.message_type),
            });
        }
        Ok(())
    }

    /// Converts to the JSON-RPC 2.0 wire shape
    ///
    /// The request id is the JSON-RPC id when one is attached, the message
    /// id otherwise. The method comes from the reserved `method` metadata
    /// key, which is excluded from the params metadata.
    #[must_use]
    pub fn to_jsonrpc(&self) -> Value {
        let method = self
            .metadata
            .get(METHOD_KEY)
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_METHOD);
        let params_metadata: Map<String, Value> = self
            .metadata
            .iter()
            .filter(|(key, _)| key.as_str() != METHOD_KEY)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        json!({
            "jsonrpc": "2.0",
            "id": self.jsonrpc_id.clone().unwrap_or_else(|| json!(self.id.to_string())),
            "method": method,
            "params": {
                "sender_id": self.sender_id.as_ref().map(ToString::to_string),
                "receiver_id": self.receiver_id.as_ref().map(ToString::to_string),
                "content": self.content,
                "type": serde_json::to_value(self.message_type).expect("enum serializes"),
                "priority": u8::from(self.priority),
                "metadata": params_metadata,
            },
        })
    }

    /// Reconstructs a message from the JSON-RPC 2.0 wire shape
    ///
    /// # Errors
    ///
    /// Returns `InvalidParams` when the params carry an unknown type tag,
    /// an out-of-range priority, or malformed identifiers.
    pub fn from_jsonrpc(frame: &Value) -> Result<Self> {
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        let mut metadata = params
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let method = frame
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_METHOD);
        metadata.insert(METHOD_KEY.to_string(), json!(method));

        let message_type = match params.get("type") {
            Some(tag) => serde_json::from_value(tag.clone())?,
            None => MessageType::Text,
        };
        let priority = match params.get("priority").and_then(Value::as_i64) {
            Some(value) => MessagePriority::try_from(u8::try_from(value).map_err(|_| {
                CoordinationError::InvalidParams {
                    reason: format!("priority out of range: {value}"),
                }
            })?)
            .map_err(|reason| CoordinationError::InvalidParams { reason })?,
            None => MessagePriority::Normal,
        };

        Ok(Self {
            id: MessageId::generate(),
            jsonrpc_id: frame.get("id").cloned(),
            sender_id: parse_agent_id(params.get("sender_id"))?,
            sender_did: None,
            receiver_id: parse_agent_id(params.get("receiver_id"))?,
            receiver_did: None,
            content: params.get("content").cloned().unwrap_or(Value::Null),
            message_type,
            priority,
            metadata,
            timestamp: Timestamp::now(),
            encrypted: false,
            signature: None,
            requires_approval: false,
            task_id: None,
            correlation_id: None,
        })
    }
}

fn parse_agent_id(value: Option<&Value>) -> Result<Option<AgentId>> {
    match value.and_then(Value::as_str) {
        None | Some("") => Ok(None),
        Some(raw) => AgentId::try_new(raw.to_string())
            .map(Some)
            .map_err(|err| CoordinationError::InvalidParams {
                reason: err.to_string(),
            }),
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => !text.is_empty() && text != "false",
        Some(Value::Number(number)) => number.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}
