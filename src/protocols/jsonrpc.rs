//! JSON-RPC 2.0 engine
//!
//! Full implementation of the JSON-RPC 2.0 request lifecycle: single
//! requests, notifications (no id, no response), and batches. Method
//! handlers are registered by name and decode their own parameter schemas;
//! a schema mismatch surfaces as the standard `-32602`.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::error::{CoordinationError, Result};

/// Protocol version string
pub const VERSION: &str = "2.0";

/// Spec-defined error codes
pub mod codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i64 = -32603;
    /// First server-defined error code
    pub const SERVER_ERROR: i64 = -32000;
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code
    pub code: i64,
    /// Human-readable message
    pub message: String,
    /// Structured error details; carries the taxonomy `kind`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Creates an error with no data
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<&CoordinationError> for JsonRpcError {
    fn from(err: &CoordinationError) -> Self {
        Self {
            code: err.jsonrpc_code(),
            message: err.to_string(),
            data: Some(json!({"kind": err.kind()})),
        }
    }
}

/// JSON-RPC response object
#[derive(Debug, Clone)]
pub struct JsonRpcResponse {
    /// Request id; `Null` when the request id could not be read
    pub id: Value,
    /// Success result, mutually exclusive with `error`
    pub result: Option<Value>,
    /// Failure, mutually exclusive with `result`
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Successful response
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response
    #[must_use]
    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Whether this is an error response
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Serializes to the wire object
    #[must_use]
    pub fn to_value(&self) -> Value {
        match (&self.result, &self.error) {
            (_, Some(error)) => json!({
                "jsonrpc": VERSION,
                "id": self.id,
                "error": serde_json::to_value(error).expect("error serializes"),
            }),
            (result, None) => json!({
                "jsonrpc": VERSION,
                "id": self.id,
                "result": result.clone().unwrap_or(Value::Null),
            }),
        }
    }
}

/// Engine output for one inbound payload
#[derive(Debug, Clone)]
pub enum RpcReply {
    /// The payload was a notification (or a batch of only notifications)
    None,
    /// One response
    Single(JsonRpcResponse),
    /// Batch responses in arrival order, notifications omitted
    Batch(Vec<JsonRpcResponse>),
}

impl RpcReply {
    /// Serializes to the wire shape; `Null` when there is nothing to send
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::None => Value::Null,
            Self::Single(response) => response.to_value(),
            Self::Batch(responses) => {
                Value::Array(responses.iter().map(JsonRpcResponse::to_value).collect())
            }
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
type MethodFn = dyn Fn(Value) -> HandlerFuture + Send + Sync;

/// Method dispatch engine
#[derive(Default)]
pub struct JsonRpcEngine {
    methods: DashMap<String, Arc<MethodFn>>,
}

impl JsonRpcEngine {
    /// Creates an engine with an empty dispatch table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an async handler under `name`, replacing any prior one
    pub fn register_method<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let name = name.into();
        debug!(method = %name, "registered JSON-RPC method");
        self.methods.insert(
            name,
            Arc::new(move |params| Box::pin(handler(params)) as HandlerFuture),
        );
    }

    /// Removes the handler registered under `name`
    pub fn unregister_method(&self, name: &str) {
        self.methods.remove(name);
    }

    /// Whether a handler is registered under `name`
    #[must_use]
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Handles a raw text frame
    ///
    /// Unparseable JSON yields a single `-32700` response with a null id.
    pub async fn handle_text(&self, raw: &str) -> RpcReply {
        match serde_json::from_str::<Value>(raw) {
            Ok(payload) => self.handle_value(payload).await,
            Err(err) => RpcReply::Single(JsonRpcResponse::failure(
                Value::Null,
                JsonRpcError::new(codes::PARSE_ERROR, format!("parse error: {err}")),
            )),
        }
    }

    /// Handles a decoded payload: a single request or a batch
    ///
    /// An empty batch yields a single invalid-request error with a null id;
    /// a non-array payload is treated as a single request.
    pub async fn handle_value(&self, payload: Value) -> RpcReply {
        match payload {
            Value::Array(entries) => {
                if entries.is_empty() {
                    return RpcReply::Single(JsonRpcResponse::failure(
                        Value::Null,
                        JsonRpcError::new(codes::INVALID_REQUEST, "empty batch"),
                    ));
                }
                let mut responses = Vec::new();
                for entry in entries {
                    if let Some(response) = self.handle_request(entry).await {
                        responses.push(response);
                    }
                }
                if responses.is_empty() {
                    RpcReply::None
                } else {
                    RpcReply::Batch(responses)
                }
            }
            single => match self.handle_request(single).await {
                Some(response) => RpcReply::Single(response),
                None => RpcReply::None,
            },
        }
    }

    /// Handles one request object; `None` means it was a notification
    async fn handle_request(&self, payload: Value) -> Option<JsonRpcResponse> {
        let Value::Object(request) = payload else {
            return Some(JsonRpcResponse::failure(
                Value::Null,
                JsonRpcError::new(codes::INVALID_REQUEST, "request must be an object"),
            ));
        };

        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let is_notification = id.is_null();

        if request.get("jsonrpc").and_then(Value::as_str) != Some(VERSION) {
            if is_notification {
                return None;
            }
            return Some(JsonRpcResponse::failure(
                id,
                JsonRpcError::new(codes::INVALID_REQUEST, "invalid JSON-RPC version"),
            ));
        }
        let Some(method) = request.get("method").and_then(Value::as_str) else {
            if is_notification {
                return None;
            }
            return Some(JsonRpcResponse::failure(
                id,
                JsonRpcError::new(codes::INVALID_REQUEST, "missing method"),
            ));
        };
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let Some(handler) = self.methods.get(method).map(|entry| Arc::clone(entry.value())) else {
            if is_notification {
                warn!(method, "notification for unknown method dropped");
                return None;
            }
            return Some(JsonRpcResponse::failure(
                id,
                JsonRpcError::new(
                    codes::METHOD_NOT_FOUND,
                    format!("method not found: {method}"),
                ),
            ));
        };

        let outcome = handler(params).await;
        if is_notification {
            if let Err(err) = outcome {
                error!(method, %err, "notification handler failed");
            }
            return None;
        }
        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(err) => JsonRpcResponse::failure(id, JsonRpcError::from(&err)),
        })
    }
}

/// Decodes a typed parameter struct, surfacing schema mismatches as
/// `InvalidParams`
///
/// # Errors
///
/// `InvalidParams` when the params do not match `T`'s schema.
pub fn decode_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|err| CoordinationError::InvalidParams {
        reason: err.to_string(),
    })
}
