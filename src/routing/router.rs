//! Message router
//!
//! Central dispatch: resolves a target for each message (direct address,
//! capability lookup, or broadcast), stamps the receiver DID from the
//! registry, emits `message.sent`, and hands the message to the receiving
//! agent's delivery channel. The router never waits for a reply.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::AgentStatus;
use crate::domain_types::{AgentId, CapabilityName};
use crate::error::{CoordinationError, Result, retry_transient};
use crate::event_payload;
use crate::events::{Event, EventBus, EventKind};
use crate::manifest::ManifestService;
use crate::message::{Message, MessageType};
use crate::registry::AgentRegistry;
use crate::routing::cost_aware::{CostAwareRouter, RoutingStrategy};

/// Metadata key naming the capability a message needs
pub const REQUIRED_CAPABILITY_KEY: &str = "required_capability";
/// Default bound on a single delivery attempt
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// External delivery seam: hands a finalized message to an agent
///
/// Implementations must not block indefinitely; the router bounds each call
/// with a timeout and treats failures as transient.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Delivers `message` to `agent_id`
    async fn deliver(&self, agent_id: &AgentId, message: Message) -> Result<()>;
}

/// Queue-backed delivery channel
///
/// Each agent registers a bounded queue; delivery is a non-blocking send.
/// An unregistered agent is not an error: the message is dropped with a
/// warning, mirroring agents that connect lazily.
#[derive(Default)]
pub struct ChannelDelivery {
    queues: DashMap<AgentId, mpsc::Sender<Message>>,
}

impl ChannelDelivery {
    /// Creates an empty channel registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a delivery queue for `agent_id`, returning the consumer end
    #[must_use]
    pub fn register_queue(&self, agent_id: AgentId, capacity: usize) -> mpsc::Receiver<Message> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        self.queues.insert(agent_id, sender);
        receiver
    }

    /// Drops the delivery queue for `agent_id`
    pub fn deregister_queue(&self, agent_id: &AgentId) {
        self.queues.remove(agent_id);
    }
}

#[async_trait]
impl DeliveryChannel for ChannelDelivery {
    async fn deliver(&self, agent_id: &AgentId, message: Message) -> Result<()> {
        let Some(queue) = self.queues.get(agent_id) else {
            warn!(agent_id = %agent_id, "no delivery queue registered; dropping message");
            return Ok(());
        };
        match queue.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(CoordinationError::Transient {
                reason: format!("delivery queue full for {agent_id}"),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CoordinationError::Transient {
                reason: format!("delivery queue closed for {agent_id}"),
            }),
        }
    }
}

/// Outcome of a routing attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to exactly one agent
    Delivered(AgentId),
    /// Broadcast; carries the number of successful deliveries
    Broadcast {
        /// Recipients that accepted the message
        delivered: usize,
        /// Recipients attempted
        attempted: usize,
    },
}

/// Central message router
pub struct MessageRouter {
    registry: Arc<AgentRegistry>,
    selector: Arc<CostAwareRouter>,
    event_bus: Arc<EventBus>,
    delivery: Arc<dyn DeliveryChannel>,
}

impl MessageRouter {
    /// Wires a router over its collaborators
    #[must_use]
    pub fn new(
        registry: Arc<AgentRegistry>,
        manifests: Arc<ManifestService>,
        event_bus: Arc<EventBus>,
        delivery: Arc<dyn DeliveryChannel>,
    ) -> Self {
        Self {
            registry,
            selector: Arc::new(CostAwareRouter::new(manifests)),
            event_bus,
            delivery,
        }
    }

    /// The capability selector, for direct strategy queries
    #[must_use]
    pub fn selector(&self) -> &Arc<CostAwareRouter> {
        &self.selector
    }

    /// Replaces the selector's routing strategy
    pub fn set_strategy(&self, strategy: RoutingStrategy) {
        self.selector.set_strategy(strategy);
    }

    /// Routes a message per the resolution chain
    ///
    /// 1. A set `receiver_id` dispatches directly.
    /// 2. A `required_capability` metadata entry delegates to the selector.
    /// 3. Notifications broadcast.
    /// 4. Anything else is `NoRoute`.
    ///
    /// # Errors
    ///
    /// `NotFound` for a direct address to an unknown agent, `NoRoute` when
    /// no resolution applies or the selector found no candidate, and
    /// promoted delivery failures.
    pub async fn route(&self, message: Message) -> Result<RouteOutcome> {
        message.validate()?;

        if let Some(receiver) = message.receiver_id.clone() {
            let delivered = self.dispatch(message, receiver).await?;
            return Ok(RouteOutcome::Delivered(delivered));
        }

        let required_capability = message
            .metadata
            .get(REQUIRED_CAPABILITY_KEY)
            .and_then(Value::as_str)
            .map(|tag| CapabilityName::try_new(tag.to_string()));
        if let Some(capability) = required_capability {
            let capability = capability.map_err(|err| CoordinationError::InvalidParams {
                reason: err.to_string(),
            })?;
            return self.route_by_capability(message, &capability, None).await;
        }

        if message.message_type == MessageType::Notification {
            return self.broadcast(message).await;
        }

        Err(CoordinationError::NoRoute {
            reason: "message has no receiver, capability, or broadcast type".into(),
        })
    }

    /// Routes a message to the best agent advertising `capability`
    ///
    /// # Errors
    ///
    /// `NoRoute` when no agent satisfies the capability.
    pub async fn route_by_capability(
        &self,
        message: Message,
        capability: &CapabilityName,
        strategy: Option<RoutingStrategy>,
    ) -> Result<RouteOutcome> {
        let Some(agent_id) = self
            .selector
            .select(capability, strategy, None, None)
            .await?
        else {
            return Err(CoordinationError::NoRoute {
                reason: format!("no agent provides capability {capability}"),
            });
        };
        let delivered = self.dispatch(message, agent_id).await?;
        Ok(RouteOutcome::Delivered(delivered))
    }

    /// Broadcasts to all agents matching the metadata capability, or to
    /// every active agent when no capability is named
    ///
    /// Succeeds iff at least one delivery succeeded. Broadcast provides no
    /// cross-recipient ordering.
    ///
    /// # Errors
    ///
    /// `NoRoute` when every delivery failed or there were no recipients.
    pub async fn broadcast(&self, message: Message) -> Result<RouteOutcome> {
        let capability = message
            .metadata
            .get(REQUIRED_CAPABILITY_KEY)
            .and_then(Value::as_str)
            .and_then(|tag| CapabilityName::try_new(tag.to_string()).ok());

        let recipients: Vec<AgentId> = match capability {
            Some(capability) => self
                .registry
                .list_by_capability(&capability)
                .into_iter()
                .map(|agent| agent.id)
                .collect(),
            None => self
                .registry
                .list(Some(AgentStatus::Active))
                .into_iter()
                .map(|agent| agent.id)
                .collect(),
        };

        let attempted = recipients.len();
        let mut delivered = 0;
        for receiver in recipients {
            if self.dispatch(message.clone(), receiver).await.is_ok() {
                delivered += 1;
            }
        }

        info!(delivered, attempted, message_id = %message.id, "broadcast complete");
        if delivered == 0 {
            return Err(CoordinationError::NoRoute {
                reason: "broadcast reached no agents".into(),
            });
        }
        Ok(RouteOutcome::Broadcast {
            delivered,
            attempted,
        })
    }

    /// Finalizes addressing and hands the message to the delivery channel
    async fn dispatch(&self, mut message: Message, receiver: AgentId) -> Result<AgentId> {
        let agent = self
            .registry
            .get(&receiver)
            .ok_or_else(|| CoordinationError::not_found("agent", receiver.to_string()))?;

        message.receiver_id = Some(receiver.clone());
        message.receiver_did = agent.did;

        self.event_bus.emit(
            Event::new(
                EventKind::MessageSent,
                event_payload! {
                    "message_id" => message.id.to_string(),
                    "sender_id" => message.sender_id.as_ref().map(ToString::to_string),
                    "receiver_id" => receiver.to_string(),
                },
            )
            .with_source("router")
            .with_correlation(message.correlation_id.clone()),
        );

        let delivery = Arc::clone(&self.delivery);
        let agent_id = receiver.clone();
        retry_transient(|| {
            let delivery = Arc::clone(&delivery);
            let agent_id = agent_id.clone();
            let message = message.clone();
            async move {
                match tokio::time::timeout(DELIVERY_TIMEOUT, delivery.deliver(&agent_id, message))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(CoordinationError::Transient {
                        reason: format!("delivery to {agent_id} timed out"),
                    }),
                }
            }
        })
        .await?;

        debug!(receiver = %receiver, "dispatched message");
        Ok(receiver)
    }
}
