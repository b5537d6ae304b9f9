//! A2A task protocol
//!
//! Extends the JSON-RPC engine with the three task methods (`tasks/send`,
//! `tasks/status`, `tasks/cancel`) bound to a task store owned by this
//! engine. The task lifecycle is a DAG with immutable terminal states;
//! `update_task_status` is the single point of mutation.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain_types::{AgentId, TaskId, Timestamp};
use crate::error::{CoordinationError, Result};
use crate::event_payload;
use crate::events::{Event, EventBus, EventKind};
use crate::message::{Message, MessagePriority, MessageType};
use crate::routing::MessageRouter;
use crate::protocols::jsonrpc::{JsonRpcEngine, decode_params};

/// Metadata key recording which A2A method produced a message
pub const A2A_METHOD_KEY: &str = "a2a_method";

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, not yet picked up
    Pending,
    /// Being worked
    Running,
    /// Finished successfully (terminal)
    Completed,
    /// Finished unsuccessfully (terminal)
    Failed,
    /// Cancelled before completion (terminal)
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal; terminal statuses are immutable
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the lifecycle DAG permits `self → next`
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Failed | Self::Cancelled),
            Self::Running => matches!(next, Self::Completed | Self::Failed | Self::Cancelled),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

/// A unit of work tracked by the A2A engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier
    pub id: TaskId,
    /// Captured request payload
    pub payload: Value,
    /// Target agent
    pub target_agent: AgentId,
    /// Requesting agent, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<AgentId>,
    /// Priority the task message was routed with
    pub priority: MessagePriority,
    /// Lifecycle status
    pub status: TaskStatus,
    /// Creation time
    pub created_at: Timestamp,
    /// Advances with every state change
    pub updated_at: Timestamp,
    /// Result recorded on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error recorded on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TasksSendParams {
    task: Value,
    target_agent: String,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    sender_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskIdParams {
    task_id: String,
}

/// JSON-RPC-mounted task engine owning the task store
pub struct A2aTaskEngine {
    tasks: DashMap<TaskId, Task>,
    router: Arc<MessageRouter>,
    event_bus: Arc<EventBus>,
}

impl A2aTaskEngine {
    /// Creates an engine over the router it dispatches task messages with
    #[must_use]
    pub fn new(router: Arc<MessageRouter>, event_bus: Arc<EventBus>) -> Self {
        Self {
            tasks: DashMap::new(),
            router,
            event_bus,
        }
    }

    /// Registers `tasks/send`, `tasks/status`, and `tasks/cancel` on `engine`
    pub fn mount(self: &Arc<Self>, engine: &JsonRpcEngine) {
        let this = Arc::clone(self);
        engine.register_method("tasks/send", move |params| {
            let this = Arc::clone(&this);
            async move { this.tasks_send(params).await }
        });

        let this = Arc::clone(self);
        engine.register_method("tasks/status", move |params| {
            let this = Arc::clone(&this);
            async move { this.tasks_status(params) }
        });

        let this = Arc::clone(self);
        engine.register_method("tasks/cancel", move |params| {
            let this = Arc::clone(&this);
            async move { this.tasks_cancel(params) }
        });
    }

    /// `tasks/send`: create a pending task and route its message
    ///
    /// Routing failure does not fail the call: the task transitions to
    /// `failed` with the error recorded, and the method still returns the
    /// task id so the caller can poll.
    async fn tasks_send(&self, params: Value) -> Result<Value> {
        let params: TasksSendParams = decode_params(params)?;
        let target_agent =
            AgentId::try_new(params.target_agent.clone()).map_err(|err| {
                CoordinationError::InvalidParams {
                    reason: format!("target_agent: {err}"),
                }
            })?;
        let sender_id = match &params.sender_id {
            Some(raw) if !raw.is_empty() => Some(AgentId::try_new(raw.clone()).map_err(|err| {
                CoordinationError::InvalidParams {
                    reason: format!("sender_id: {err}"),
                }
            })?),
            _ => None,
        };
        let priority = MessagePriority::clamped(params.priority.unwrap_or(2));

        let task_id = TaskId::generate();
        let now = Timestamp::now();
        let task = Task {
            id: task_id,
            payload: params.task.clone(),
            target_agent: target_agent.clone(),
            sender_id: sender_id.clone(),
            priority,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
        };
        self.tasks.insert(task_id, task);
        self.event_bus.emit(
            Event::new(
                EventKind::TaskCreated,
                event_payload! {
                    "task_id" => task_id.to_string(),
                    "target_agent" => target_agent.to_string(),
                },
            )
            .with_source("a2a"),
        );

        let sender = sender_id
            .clone()
            .unwrap_or_else(|| AgentId::try_new("a2a".to_string()).expect("literal id is non-empty"));
        let mut message = Message::new(sender, params.task);
        message.receiver_id = Some(target_agent.clone());
        message.message_type = MessageType::Task;
        message.priority = priority;
        message.task_id = Some(task_id);
        message
            .metadata
            .insert(A2A_METHOD_KEY.to_string(), json!("tasks/send"));

        if let Err(err) = self.router.route(message).await {
            error!(task_id = %task_id, %err, "task message routing failed");
            // Record the failure; the caller still gets the id to poll.
            let _ = self.update_task_status(
                task_id,
                TaskStatus::Failed,
                None,
                Some(err.to_string()),
            );
        }

        let status = self
            .tasks
            .get(&task_id)
            .map(|task| task.status)
            .unwrap_or(TaskStatus::Pending);
        info!(task_id = %task_id, target = %target_agent, "created task");
        Ok(json!({
            "task_id": task_id.to_string(),
            "status": status,
        }))
    }

    /// `tasks/status`: report the task's current state
    fn tasks_status(&self, params: Value) -> Result<Value> {
        let params: TaskIdParams = decode_params(params)?;
        let task_id = parse_task_id(&params.task_id)?;
        let task = self
            .tasks
            .get(&task_id)
            .ok_or_else(|| CoordinationError::not_found("task", params.task_id.clone()))?;

        Ok(json!({
            "task_id": task.id.to_string(),
            "status": task.status,
            "created_at": task.created_at,
            "updated_at": task.updated_at,
            "result": task.result,
            "error": task.error,
        }))
    }

    /// `tasks/cancel`: advisory cancellation
    ///
    /// In-flight work is not unwound; the terminal `cancelled` status only
    /// guarantees that later status updates are refused.
    fn tasks_cancel(&self, params: Value) -> Result<Value> {
        let params: TaskIdParams = decode_params(params)?;
        let task_id = parse_task_id(&params.task_id)?;
        {
            let task = self
                .tasks
                .get(&task_id)
                .ok_or_else(|| CoordinationError::not_found("task", params.task_id.clone()))?;
            if task.status.is_terminal() {
                return Err(CoordinationError::InvalidState {
                    reason: format!("cannot cancel task in status {:?}", task.status),
                });
            }
        }
        self.update_task_status(task_id, TaskStatus::Cancelled, None, None)?;
        info!(task_id = %task_id, "cancelled task");
        Ok(json!({
            "task_id": task_id.to_string(),
            "status": TaskStatus::Cancelled,
        }))
    }

    /// Fetches a task snapshot
    #[must_use]
    pub fn get_task(&self, task_id: TaskId) -> Option<Task> {
        self.tasks.get(&task_id).map(|task| task.clone())
    }

    /// The single point of task mutation
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown task; `InvalidState` for a transition the
    /// lifecycle DAG forbids (in particular, any exit from a terminal
    /// state).
    pub fn update_task_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        let mut entry = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| CoordinationError::not_found("task", task_id.to_string()))?;
        let task = entry.value_mut();

        if !task.status.can_transition_to(status) {
            warn!(task_id = %task_id, from = ?task.status, to = ?status, "refused transition");
            return Err(CoordinationError::InvalidState {
                reason: format!("cannot transition task from {:?} to {status:?}", task.status),
            });
        }

        task.status = status;
        task.updated_at = Timestamp::after(task.updated_at);
        if let Some(result) = result {
            task.result = Some(result);
        }
        if let Some(error) = error {
            task.error = Some(error);
        }
        drop(entry);

        match status {
            TaskStatus::Completed => self.event_bus.emit(
                Event::new(
                    EventKind::TaskCompleted,
                    event_payload! {"task_id" => task_id.to_string()},
                )
                .with_source("a2a"),
            ),
            TaskStatus::Failed => self.event_bus.emit(
                Event::new(
                    EventKind::TaskFailed,
                    event_payload! {"task_id" => task_id.to_string()},
                )
                .with_source("a2a"),
            ),
            _ => {}
        }
        Ok(())
    }
}

fn parse_task_id(raw: &str) -> Result<TaskId> {
    Uuid::from_str(raw)
        .map(TaskId::new)
        .map_err(|_| CoordinationError::not_found("task", raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::domain_types::RoleName;
    use crate::manifest::ManifestService;
    use crate::registry::AgentRegistry;
    use crate::routing::{ChannelDelivery, DeliveryChannel};
    use crate::storage::MemoryStorage;

    fn engine() -> (Arc<A2aTaskEngine>, Arc<AgentRegistry>) {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&bus), 100));
        let manifests = Arc::new(ManifestService::new(
            Arc::new(MemoryStorage::new()),
            Arc::clone(&bus),
        ));
        let delivery = Arc::new(ChannelDelivery::new()) as Arc<dyn DeliveryChannel>;
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            manifests,
            Arc::clone(&bus),
            delivery,
        ));
        (
            Arc::new(A2aTaskEngine::new(router, Arc::clone(&bus))),
            registry,
        )
    }

    fn register(registry: &AgentRegistry, id: &str) {
        registry
            .register(
                Agent::new(
                    AgentId::try_new(id.to_string()).unwrap(),
                    id,
                    RoleName::try_new("general".to_string()).unwrap(),
                )
                .activated(),
            )
            .unwrap();
    }

    async fn send(engine: &A2aTaskEngine, target: &str) -> (TaskId, TaskStatus) {
        let result = engine
            .tasks_send(json!({
                "task": {"do": "x"},
                "target_agent": target,
                "priority": 3,
                "sender_id": "u0",
            }))
            .await
            .unwrap();
        let task_id = parse_task_id(result["task_id"].as_str().unwrap()).unwrap();
        let status: TaskStatus = serde_json::from_value(result["status"].clone()).unwrap();
        (task_id, status)
    }

    #[tokio::test]
    async fn send_creates_a_pending_task() {
        let (engine, registry) = engine();
        register(&registry, "u1");

        let (task_id, status) = send(&engine, "u1").await;
        assert_eq!(status, TaskStatus::Pending);

        let status = engine
            .tasks_status(json!({"task_id": task_id.to_string()}))
            .unwrap();
        assert_eq!(status["status"], "pending");
        assert!(status["result"].is_null());
    }

    #[tokio::test]
    async fn routing_failure_fails_the_task_but_returns_its_id() {
        let (engine, _registry) = engine();

        let (task_id, status) = send(&engine, "ghost").await;
        assert_eq!(status, TaskStatus::Failed);

        let task = engine.get_task(task_id).unwrap();
        assert!(task.error.as_ref().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn lifecycle_runs_to_completion_and_freezes() {
        let (engine, registry) = engine();
        register(&registry, "u1");
        let (task_id, _) = send(&engine, "u1").await;

        engine
            .update_task_status(task_id, TaskStatus::Running, None, None)
            .unwrap();
        engine
            .update_task_status(task_id, TaskStatus::Completed, Some(json!({"ok": true})), None)
            .unwrap();

        let status = engine
            .tasks_status(json!({"task_id": task_id.to_string()}))
            .unwrap();
        assert_eq!(status["status"], "completed");
        assert_eq!(status["result"]["ok"], true);

        // Terminal states are immutable.
        assert!(matches!(
            engine.update_task_status(task_id, TaskStatus::Running, None, None),
            Err(CoordinationError::InvalidState { .. })
        ));
        assert!(matches!(
            engine.tasks_cancel(json!({"task_id": task_id.to_string()})),
            Err(CoordinationError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_is_allowed_from_pending_and_running() {
        let (engine, registry) = engine();
        register(&registry, "u1");

        let (pending, _) = send(&engine, "u1").await;
        let cancelled = engine
            .tasks_cancel(json!({"task_id": pending.to_string()}))
            .unwrap();
        assert_eq!(cancelled["status"], "cancelled");

        let (running, _) = send(&engine, "u1").await;
        engine
            .update_task_status(running, TaskStatus::Running, None, None)
            .unwrap();
        engine
            .tasks_cancel(json!({"task_id": running.to_string()}))
            .unwrap();

        // Later updates against a cancelled task are refused.
        assert!(matches!(
            engine.update_task_status(running, TaskStatus::Completed, None, None),
            Err(CoordinationError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.tasks_status(json!({"task_id": TaskId::generate().to_string()})),
            Err(CoordinationError::NotFound { .. })
        ));
        assert!(matches!(
            engine.tasks_status(json!({"task_id": "not-a-uuid"})),
            Err(CoordinationError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn updated_at_advances_with_each_transition() {
        let (engine, registry) = engine();
        register(&registry, "u1");
        let (task_id, _) = send(&engine, "u1").await;

        let created = engine.get_task(task_id).unwrap();
        engine
            .update_task_status(task_id, TaskStatus::Running, None, None)
            .unwrap();
        let running = engine.get_task(task_id).unwrap();
        assert!(running.updated_at > created.updated_at);
    }
}
