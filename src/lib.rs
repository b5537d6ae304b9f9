//! # Switchboard: Agent-to-Agent Coordination Core
//!
//! Switchboard is a transport-neutral coordination service for multi-agent
//! systems: it dispatches structured requests to registered agents based on
//! declared capabilities and live performance metrics, runs a per-agent
//! Q-learning loop shaped by observed cost and latency, gates sensitive
//! requests behind a human-in-the-loop approval queue, and optionally
//! averages Q-tables across peer instances with differential privacy.
//!
//! ## Architecture Overview
//!
//! ```text
//! inbound frame -> ProtocolRouter -> Message -> HITL gate -> MessageRouter
//!                                                  |              |
//!                                                  v              v
//!                                           ApprovalQueue   AgentRegistry
//!                                                            CostAwareRouter
//!                                                                 |
//!                                                                 v
//!                                                          DeliveryChannel
//! ```
//!
//! Completion feedback flows back through the [`learning::RlEngine`], and
//! every lifecycle mutation is observable on the [`events::EventBus`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use switchboard::config::CoordinatorConfig;
//! use switchboard::coordinator::Coordinator;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = Coordinator::new(CoordinatorConfig::from_env()).await?;
//! let reply = coordinator
//!     .handle_jsonrpc(r#"{"jsonrpc": "2.0", "id": 1, "method": "tasks/status",
//!                         "params": {"task_id": "..."}}"#)
//!     .await;
//! println!("{reply}");
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod domain_types;
pub mod error;
pub mod events;
pub mod hitl;
pub mod learning;
pub mod manifest;
pub mod message;
pub mod middleware;
pub mod protocols;
pub mod registry;
pub mod routing;
pub mod storage;
pub mod telemetry;
pub mod workflow;

pub use agent::{Agent, AgentPatch, AgentStatus, PerformanceMetrics};
pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use domain_types::{
    AgentId, ApprovalId, CapabilityName, CorrelationId, Did, InstanceId, MessageId, RoleName,
    TaskId, Timestamp, WorkflowId,
};
pub use error::{CoordinationError, Result};
pub use events::{Event, EventBus, EventKind};
pub use hitl::{ApprovalQueue, ApprovalRequest, ApprovalStatus, HitlMiddleware, HitlOutcome};
pub use manifest::{Manifest, ManifestData, ManifestPatch, ManifestService};
pub use message::{Message, MessagePriority, MessageType};
pub use registry::AgentRegistry;
pub use routing::{
    ChannelDelivery, CostAwareRouter, DeliveryChannel, MessageRouter, RouteOutcome,
    RoutingStrategy,
};
pub use storage::{FileStorage, MemoryStorage, Storage};
