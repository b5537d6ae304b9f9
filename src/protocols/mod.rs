//! Protocol subsystem
//!
//! [`jsonrpc`] implements the JSON-RPC 2.0 engine, [`a2a`] mounts the task
//! protocol on top of it, and [`router`] translates between protocols at
//! the ingress boundary.

pub mod a2a;
pub mod jsonrpc;
pub mod router;

pub use a2a::{A2aTaskEngine, Task, TaskStatus};
pub use jsonrpc::{JsonRpcEngine, JsonRpcError, JsonRpcResponse, RpcReply, decode_params};
pub use router::{JsonRpcProtocolHandler, PROTOCOL_KEY, ProtocolHandler, ProtocolKind, ProtocolRouter};
