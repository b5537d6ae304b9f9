//! Coordinator wiring
//!
//! Builds the full dispatch pipeline from a [`CoordinatorConfig`]: storage,
//! event bus, registry, manifests, router, HITL gate, learning engine, and
//! the JSON-RPC surface with the A2A task methods mounted. The serving
//! layer owns transports and calls [`Coordinator::handle_jsonrpc`] /
//! [`Coordinator::ingress`]; everything behind those two calls is
//! transport-neutral.

use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::domain_types::InstanceId;
use crate::error::{CoordinationError, Result};
use crate::events::EventBus;
use crate::hitl::{ApprovalQueue, HitlMiddleware, HitlOutcome};
use crate::learning::{FrlAggregator, RlEngine};
use crate::manifest::ManifestService;
use crate::message::Message;
use crate::middleware::{RateLimiter, enforce_message_size};
use crate::protocols::{
    A2aTaskEngine, JsonRpcEngine, JsonRpcProtocolHandler, ProtocolKind, ProtocolRouter,
};
use crate::registry::AgentRegistry;
use crate::routing::{ChannelDelivery, DeliveryChannel, MessageRouter, RouteOutcome};
use crate::storage::{MemoryStorage, Storage};
use crate::workflow::{StepExecutor, WorkflowEngine};

/// Fully wired coordination core
pub struct Coordinator {
    config: CoordinatorConfig,
    event_bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
    manifests: Arc<ManifestService>,
    delivery: Arc<ChannelDelivery>,
    message_router: Arc<MessageRouter>,
    hitl: Arc<HitlMiddleware>,
    rate_limiter: RateLimiter,
    rl_engine: Arc<RlEngine>,
    frl: Option<Arc<FrlAggregator>>,
    jsonrpc: Arc<JsonRpcEngine>,
    a2a: Arc<A2aTaskEngine>,
    protocols: ProtocolRouter,
    workflows: WorkflowEngine,
    sweeper: JoinHandle<()>,
}

impl Coordinator {
    /// Builds a coordinator over in-memory storage
    ///
    /// # Errors
    ///
    /// `InvalidParams` when the configuration fails validation.
    pub async fn new(config: CoordinatorConfig) -> Result<Self> {
        Self::with_storage(config, Arc::new(MemoryStorage::new())).await
    }

    /// Builds a coordinator over the given storage backend
    ///
    /// # Errors
    ///
    /// `InvalidParams` when the configuration fails validation.
    pub async fn with_storage(
        config: CoordinatorConfig,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        config.validate()?;

        let event_bus = Arc::new(EventBus::new());
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&event_bus), config.max_agents));
        let manifests = Arc::new(ManifestService::new(
            Arc::clone(&storage),
            Arc::clone(&event_bus),
        ));
        let delivery = Arc::new(ChannelDelivery::new());
        let message_router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            Arc::clone(&manifests),
            Arc::clone(&event_bus),
            Arc::clone(&delivery) as Arc<dyn DeliveryChannel>,
        ));

        let approval_queue = Arc::new(ApprovalQueue::new(config.hitl_timeout_seconds));
        let hitl = Arc::new(HitlMiddleware::new(
            Arc::clone(&approval_queue),
            Arc::clone(&event_bus),
            &config,
        ));
        let sweeper = HitlMiddleware::spawn_sweeper(approval_queue);

        let frl = config
            .frl_enabled
            .then(|| Arc::new(FrlAggregator::new(config.frl_aggregation_interval)));
        let instance_id = InstanceId::try_new(format!("switchboard-{}", Uuid::new_v4()))
            .expect("generated instance id is non-empty");
        let rl_engine = Arc::new(RlEngine::new(
            Arc::clone(&manifests),
            Arc::clone(&event_bus),
            frl.clone(),
            instance_id,
        ));

        let jsonrpc = Arc::new(JsonRpcEngine::new());
        let a2a = Arc::new(A2aTaskEngine::new(
            Arc::clone(&message_router),
            Arc::clone(&event_bus),
        ));
        a2a.mount(&jsonrpc);

        let protocols = ProtocolRouter::new();
        let rpc_handler = Arc::new(JsonRpcProtocolHandler::new(Arc::clone(&jsonrpc)));
        protocols.register_handler(ProtocolKind::Jsonrpc, Arc::clone(&rpc_handler) as Arc<dyn crate::protocols::ProtocolHandler>);
        protocols.register_handler(ProtocolKind::A2a, rpc_handler);

        let workflows = WorkflowEngine::new(
            StepExecutor::new(Arc::clone(&message_router)),
            Arc::clone(&storage),
            Arc::clone(&event_bus),
        );

        let rate_limiter = RateLimiter::new(config.rate_limit_per_minute);
        info!(
            max_agents = config.max_agents,
            hitl = config.hitl_enabled,
            frl = config.frl_enabled,
            "coordinator ready",
        );

        Ok(Self {
            config,
            event_bus,
            registry,
            manifests,
            delivery,
            message_router,
            hitl,
            rate_limiter,
            rl_engine,
            frl,
            jsonrpc,
            a2a,
            protocols,
            workflows,
            sweeper,
        })
    }

    /// Admits one message through the full pipeline: rate limit, size
    /// bound, HITL gate, then routing
    ///
    /// # Errors
    ///
    /// `RateLimited`, `InvalidParams` (size), `ApprovalRejected` /
    /// `ApprovalExpired` from the gate, and any routing failure.
    pub async fn ingress(&self, message: Message) -> Result<RouteOutcome> {
        let sender_key = message
            .sender_id
            .as_ref()
            .map_or_else(|| "anonymous".to_string(), ToString::to_string);
        self.rate_limiter.check(&sender_key)?;
        enforce_message_size(&message, self.config.max_message_size)?;

        match self.hitl.process(message).await {
            HitlOutcome::Delivered(message) => self.message_router.route(message).await,
            HitlOutcome::Rejected { reason } if reason == "timeout" => {
                Err(CoordinationError::ApprovalExpired)
            }
            HitlOutcome::Rejected { reason } => Err(CoordinationError::ApprovalRejected { reason }),
        }
    }

    /// Handles a raw JSON-RPC frame, returning the wire reply
    ///
    /// `Null` means the frame was a notification and produced no reply.
    pub async fn handle_jsonrpc(&self, raw: &str) -> Value {
        self.jsonrpc.handle_text(raw).await.to_value()
    }

    /// The configuration in effect
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Event bus
    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Agent registry
    #[must_use]
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Manifest service
    #[must_use]
    pub fn manifests(&self) -> &Arc<ManifestService> {
        &self.manifests
    }

    /// Delivery channel registry
    #[must_use]
    pub fn delivery(&self) -> &Arc<ChannelDelivery> {
        &self.delivery
    }

    /// Message router
    #[must_use]
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.message_router
    }

    /// HITL middleware
    #[must_use]
    pub fn hitl(&self) -> &Arc<HitlMiddleware> {
        &self.hitl
    }

    /// Learning engine
    #[must_use]
    pub fn learning(&self) -> &Arc<RlEngine> {
        &self.rl_engine
    }

    /// Federated aggregator, when `FRL_ENABLED` is set
    #[must_use]
    pub fn frl(&self) -> Option<&Arc<FrlAggregator>> {
        self.frl.as_ref()
    }

    /// A2A task engine
    #[must_use]
    pub fn tasks(&self) -> &Arc<A2aTaskEngine> {
        &self.a2a
    }

    /// Protocol router
    #[must_use]
    pub fn protocols(&self) -> &ProtocolRouter {
        &self.protocols
    }

    /// Workflow engine
    #[must_use]
    pub fn workflows(&self) -> &WorkflowEngine {
        &self.workflows
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::domain_types::{AgentId, RoleName};
    use serde_json::json;

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = CoordinatorConfig {
            max_agents: 0,
            ..CoordinatorConfig::default()
        };
        assert!(Coordinator::new(config).await.is_err());
    }

    #[tokio::test]
    async fn ingress_runs_the_admission_checks() {
        let config = CoordinatorConfig {
            rate_limit_per_minute: 1,
            ..CoordinatorConfig::testing()
        };
        let coordinator = Coordinator::new(config).await.unwrap();
        coordinator
            .registry()
            .register(
                Agent::new(
                    AgentId::try_new("u1".to_string()).unwrap(),
                    "u1",
                    RoleName::try_new("general".to_string()).unwrap(),
                )
                .activated(),
            )
            .unwrap();

        let message = Message::new(AgentId::try_new("u0".to_string()).unwrap(), json!("hello"))
            .to(AgentId::try_new("u1".to_string()).unwrap());
        coordinator.ingress(message.clone()).await.unwrap();

        // Second message from the same sender exceeds the 1/minute budget.
        assert!(matches!(
            coordinator.ingress(message).await,
            Err(CoordinationError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn jsonrpc_surface_carries_the_task_methods() {
        let coordinator = Coordinator::new(CoordinatorConfig::testing()).await.unwrap();
        coordinator
            .registry()
            .register(
                Agent::new(
                    AgentId::try_new("u1".to_string()).unwrap(),
                    "u1",
                    RoleName::try_new("general".to_string()).unwrap(),
                )
                .activated(),
            )
            .unwrap();

        let reply = coordinator
            .handle_jsonrpc(
                r#"{"jsonrpc": "2.0", "id": 1, "method": "tasks/send",
                    "params": {"task": {"do": "x"}, "target_agent": "u1"}}"#,
            )
            .await;
        assert_eq!(reply["result"]["status"], "pending");
    }
}
