//! Workflow orchestration
//!
//! Registered workflows are step graphs persisted under `workflow:<id>`;
//! executions walk the graph sequentially, branching at conditional steps
//! whose predicates come from the bounded expression language in [`expr`].
//! Raw code evaluation is structurally impossible: a condition is data, and
//! the evaluator only knows literals, context lookups, and comparisons.

pub mod expr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::domain_types::{AgentId, CapabilityName, Timestamp, WorkflowId};
use crate::error::{CoordinationError, Result};
use crate::event_payload;
use crate::events::{Event, EventBus, EventKind};
use crate::message::{Message, MessageType};
use crate::routing::MessageRouter;
use crate::storage::Storage;

/// Storage key prefix for workflow definitions
const KEY_PREFIX: &str = "workflow:";
/// Upper bound on step executions per run; cycles hit this instead of
/// spinning forever
const MAX_STEP_EXECUTIONS: usize = 1000;
/// Upper bound on loop-step iterations
const MAX_LOOP_ITERATIONS: u64 = 1000;
/// Upper bound on a delay step
const MAX_DELAY: Duration = Duration::from_secs(300);

/// Kind of a workflow step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Route a task message to an agent (by id or capability)
    AgentCall,
    /// Branch on a bounded condition over the execution context
    Conditional,
    /// Repeat a bounded number of iterations
    Loop,
    /// Sleep for a bounded duration
    Delay,
    /// Run sub-steps concurrently
    Parallel,
}

/// Workflow lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Being authored
    Draft,
    /// Registered and runnable
    Active,
    /// An execution is in progress
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Paused by an operator
    Paused,
    /// Cancelled
    Cancelled,
}

/// One step in a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step identifier, unique within the workflow
    pub id: String,
    /// What the step does
    pub kind: StepKind,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Kind-specific configuration document
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Successor step ids; conditionals use `[then, else]`
    #[serde(default)]
    pub next_steps: Vec<String>,
    /// Bounded condition, for conditional steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Step to jump to when this step fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handler: Option<String>,
}

/// A workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow identifier
    pub id: WorkflowId,
    /// Name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Semantic version
    pub version: String,
    /// Ordered steps; execution starts at the first
    pub steps: Vec<WorkflowStep>,
    /// Lifecycle status
    pub status: WorkflowStatus,
    /// Creation time
    pub created_at: Timestamp,
    /// Last mutation time
    pub updated_at: Timestamp,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Workflow {
    /// Creates a draft workflow
    #[must_use]
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        let now = Timestamp::now();
        Self {
            id: WorkflowId::generate(),
            name: name.into(),
            description: String::new(),
            version: "1.0.0".to_string(),
            steps,
            status: WorkflowStatus::Draft,
            created_at: now,
            updated_at: now,
            metadata: Map::new(),
        }
    }

    fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.id == id)
    }
}

/// One run of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Execution identifier
    pub execution_id: Uuid,
    /// The workflow that ran
    pub workflow_id: WorkflowId,
    /// Run status
    pub status: WorkflowStatus,
    /// Step currently (or last) executing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Mutable context threaded through the steps
    pub context: Map<String, Value>,
    /// Per-step results
    pub step_results: Map<String, Value>,
    /// Start time
    pub started_at: Timestamp,
    /// Completion time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    /// Failure message, when the run failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Executes individual workflow steps
pub struct StepExecutor {
    router: Arc<MessageRouter>,
}

impl StepExecutor {
    /// Creates an executor routing agent calls through `router`
    #[must_use]
    pub fn new(router: Arc<MessageRouter>) -> Self {
        Self { router }
    }

    /// Executes one step against the current context
    ///
    /// Returns the step result document; for conditionals it carries a
    /// `next_step` naming the branch taken.
    pub fn execute_step<'a>(
        &'a self,
        step: &'a WorkflowStep,
        context: &'a Map<String, Value>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value>> + Send + 'a>> {
        Box::pin(async move {
            match step.kind {
                StepKind::AgentCall => self.execute_agent_call(step, context).await,
                StepKind::Conditional => Self::execute_conditional(step, context),
                StepKind::Loop => Self::execute_loop(step),
                StepKind::Delay => Self::execute_delay(step).await,
                StepKind::Parallel => self.execute_parallel(step, context).await,
            }
        })
    }

    async fn execute_agent_call(
        &self,
        step: &WorkflowStep,
        context: &Map<String, Value>,
    ) -> Result<Value> {
        let agent_id = step.config.get("agent_id").and_then(Value::as_str);
        let capability = step.config.get("capability").and_then(Value::as_str);
        let content = step.config.get("message").cloned().unwrap_or(Value::Null);

        let sender = context
            .get("workflow_id")
            .and_then(Value::as_str)
            .and_then(|id| AgentId::try_new(id.to_string()).ok())
            .unwrap_or_else(|| AgentId::try_new("workflow".to_string()).expect("literal id is non-empty"));
        let mut message = Message::new(sender, content).with_type(MessageType::Task);
        message
            .metadata
            .insert("workflow_step".to_string(), json!(step.id));

        match (agent_id, capability) {
            (Some(agent_id), _) => {
                let receiver =
                    AgentId::try_new(agent_id.to_string()).map_err(|err| CoordinationError::InvalidParams {
                        reason: format!("agent_id: {err}"),
                    })?;
                self.router.route(message.to(receiver)).await?;
            }
            (None, Some(capability)) => {
                let capability = CapabilityName::try_new(capability.to_string()).map_err(|err| {
                    CoordinationError::InvalidParams {
                        reason: format!("capability: {err}"),
                    }
                })?;
                self.router
                    .route_by_capability(message, &capability, None)
                    .await?;
            }
            (None, None) => {
                return Err(CoordinationError::InvalidParams {
                    reason: "agent_call step needs agent_id or capability".into(),
                });
            }
        }

        Ok(json!({"status": "completed", "result": {"message_sent": true}}))
    }

    fn execute_conditional(step: &WorkflowStep, context: &Map<String, Value>) -> Result<Value> {
        let condition = step.condition.as_deref().ok_or_else(|| {
            CoordinationError::InvalidParams {
                reason: format!("conditional step {} has no condition", step.id),
            }
        })?;
        let holds = expr::evaluate(condition, &Value::Object(context.clone()))?;
        let next_step = if holds {
            step.next_steps.first()
        } else {
            step.next_steps.get(1)
        };
        Ok(json!({
            "status": "completed",
            "result": {"condition_result": holds},
            "next_step": next_step,
        }))
    }

    fn execute_loop(step: &WorkflowStep) -> Result<Value> {
        let iterations = step
            .config
            .get("iterations")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .min(MAX_LOOP_ITERATIONS);
        Ok(json!({
            "status": "completed",
            "result": {"iterations": iterations},
        }))
    }

    async fn execute_delay(step: &WorkflowStep) -> Result<Value> {
        let delay_seconds = step
            .config
            .get("delay_seconds")
            .and_then(Value::as_f64)
            .unwrap_or(1.0)
            .max(0.0);
        let delay = Duration::from_secs_f64(delay_seconds).min(MAX_DELAY);
        tokio::time::sleep(delay).await;
        Ok(json!({
            "status": "completed",
            "result": {"delayed_seconds": delay.as_secs_f64()},
        }))
    }

    async fn execute_parallel(
        &self,
        step: &WorkflowStep,
        context: &Map<String, Value>,
    ) -> Result<Value> {
        let sub_steps: Vec<WorkflowStep> = match step.config.get("steps") {
            Some(raw) => serde_json::from_value(raw.clone())?,
            None => Vec::new(),
        };
        let futures = sub_steps
            .iter()
            .map(|sub_step| self.execute_step(sub_step, context));
        let results = futures::future::join_all(futures).await;
        let completed = results.iter().filter(|result| result.is_ok()).count();
        if completed < results.len() {
            let first_error = results
                .into_iter()
                .find_map(std::result::Result::err)
                .expect("at least one error exists");
            return Err(first_error);
        }
        Ok(json!({
            "status": "completed",
            "result": {"parallel_completed": completed},
        }))
    }
}

/// Registers and executes workflows
pub struct WorkflowEngine {
    executor: StepExecutor,
    storage: Arc<dyn Storage>,
    event_bus: Arc<EventBus>,
}

impl WorkflowEngine {
    /// Creates an engine persisting definitions to `storage`
    #[must_use]
    pub fn new(executor: StepExecutor, storage: Arc<dyn Storage>, event_bus: Arc<EventBus>) -> Self {
        Self {
            executor,
            storage,
            event_bus,
        }
    }

    fn key(workflow_id: WorkflowId) -> String {
        format!("{KEY_PREFIX}{workflow_id}")
    }

    /// Persists a workflow definition
    pub async fn register(&self, workflow: &Workflow) -> Result<()> {
        let document = serde_json::to_value(workflow).map_err(|err| CoordinationError::Fatal {
            reason: format!("workflow serialization failed: {err}"),
        })?;
        self.storage.set(&Self::key(workflow.id), document).await?;
        info!(workflow_id = %workflow.id, name = %workflow.name, "registered workflow");
        Ok(())
    }

    /// Loads a workflow definition
    pub async fn get(&self, workflow_id: WorkflowId) -> Result<Option<Workflow>> {
        let Some(document) = self.storage.get(&Self::key(workflow_id)).await? else {
            return Ok(None);
        };
        let workflow = serde_json::from_value(document).map_err(|err| CoordinationError::Fatal {
            reason: format!("corrupt workflow document for {workflow_id}: {err}"),
        })?;
        Ok(Some(workflow))
    }

    /// Lists every registered workflow
    pub async fn list(&self) -> Result<Vec<Workflow>> {
        let keys = self.storage.list_keys(KEY_PREFIX).await?;
        let mut workflows = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw_id) = key.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            let Ok(uuid) = Uuid::from_str(raw_id) else {
                continue;
            };
            if let Some(workflow) = self.get(WorkflowId::new(uuid)).await? {
                workflows.push(workflow);
            }
        }
        Ok(workflows)
    }

    /// Runs a workflow to completion
    ///
    /// Steps execute sequentially from the first; conditionals pick their
    /// branch, failures jump to the step's error handler when one is named.
    /// The returned execution is `completed` or `failed`; a failed run
    /// records its error rather than propagating it.
    ///
    /// # Errors
    ///
    /// `NotFound` when the workflow does not exist.
    pub async fn execute(
        &self,
        workflow_id: WorkflowId,
        initial_context: Map<String, Value>,
    ) -> Result<WorkflowExecution> {
        let workflow = self
            .get(workflow_id)
            .await?
            .ok_or_else(|| CoordinationError::not_found("workflow", workflow_id.to_string()))?;

        let mut execution = WorkflowExecution {
            execution_id: Uuid::new_v4(),
            workflow_id,
            status: WorkflowStatus::Running,
            current_step: None,
            context: initial_context,
            step_results: Map::new(),
            started_at: Timestamp::now(),
            completed_at: None,
            error: None,
        };
        execution.context.insert(
            "workflow_id".to_string(),
            json!(workflow_id.to_string()),
        );

        self.event_bus.emit(
            Event::new(
                EventKind::WorkflowStarted,
                event_payload! {
                    "execution_id" => execution.execution_id.to_string(),
                    "workflow_id" => workflow_id.to_string(),
                },
            )
            .with_source("workflow"),
        );

        match self.run_steps(&workflow, &mut execution).await {
            Ok(()) => {
                execution.status = WorkflowStatus::Completed;
                execution.completed_at = Some(Timestamp::now());
                self.event_bus.emit(
                    Event::new(
                        EventKind::WorkflowCompleted,
                        event_payload! {
                            "execution_id" => execution.execution_id.to_string(),
                            "workflow_id" => workflow_id.to_string(),
                        },
                    )
                    .with_source("workflow"),
                );
            }
            Err(err) => {
                error!(workflow_id = %workflow_id, %err, "workflow execution failed");
                execution.status = WorkflowStatus::Failed;
                execution.error = Some(err.to_string());
                execution.completed_at = Some(Timestamp::now());
            }
        }
        Ok(execution)
    }

    async fn run_steps(
        &self,
        workflow: &Workflow,
        execution: &mut WorkflowExecution,
    ) -> Result<()> {
        let mut current = workflow.steps.first();
        let mut executed = 0;

        while let Some(step) = current {
            if executed >= MAX_STEP_EXECUTIONS {
                return Err(CoordinationError::InvalidState {
                    reason: format!("workflow exceeded {MAX_STEP_EXECUTIONS} step executions"),
                });
            }
            executed += 1;
            execution.current_step = Some(step.id.clone());

            let outcome = self.executor.execute_step(step, &execution.context).await;
            let result = match outcome {
                Ok(result) => result,
                Err(err) => match &step.error_handler {
                    Some(handler_id) => {
                        execution
                            .step_results
                            .insert(step.id.clone(), json!({"status": "failed", "error": err.to_string()}));
                        current = workflow.step(handler_id);
                        if current.is_none() {
                            return Err(CoordinationError::InvalidParams {
                                reason: format!("error handler {handler_id} does not exist"),
                            });
                        }
                        continue;
                    }
                    None => return Err(err),
                },
            };

            execution
                .step_results
                .insert(step.id.clone(), result.clone());
            if let Some(outputs) = result.get("result").and_then(Value::as_object) {
                execution.context.extend(outputs.clone());
            }

            let explicit_next = result
                .get("next_step")
                .and_then(Value::as_str)
                .map(str::to_string);
            current = match explicit_next {
                Some(next_id) => workflow.step(&next_id),
                None => step
                    .next_steps
                    .first()
                    .and_then(|next_id| workflow.step(next_id)),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::manifest::ManifestService;
    use crate::registry::AgentRegistry;
    use crate::routing::{ChannelDelivery, DeliveryChannel};
    use crate::storage::MemoryStorage;

    fn engine() -> (WorkflowEngine, Arc<AgentRegistry>, Arc<ChannelDelivery>) {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&bus), 100));
        let manifests = Arc::new(ManifestService::new(
            Arc::new(MemoryStorage::new()),
            Arc::clone(&bus),
        ));
        let delivery = Arc::new(ChannelDelivery::new());
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            manifests,
            Arc::clone(&bus),
            Arc::clone(&delivery) as Arc<dyn DeliveryChannel>,
        ));
        (
            WorkflowEngine::new(
                StepExecutor::new(router),
                Arc::new(MemoryStorage::new()),
                bus,
            ),
            registry,
            delivery,
        )
    }

    fn conditional_workflow() -> Workflow {
        Workflow::new(
            "branching",
            vec![
                WorkflowStep {
                    id: "check".into(),
                    kind: StepKind::Conditional,
                    name: "check retries".into(),
                    config: Map::new(),
                    next_steps: vec!["low".into(), "high".into()],
                    condition: Some("context.retries < 3".into()),
                    error_handler: None,
                },
                WorkflowStep {
                    id: "low".into(),
                    kind: StepKind::Loop,
                    name: String::new(),
                    config: Map::from_iter([("iterations".to_string(), json!(2))]),
                    next_steps: vec![],
                    condition: None,
                    error_handler: None,
                },
                WorkflowStep {
                    id: "high".into(),
                    kind: StepKind::Loop,
                    name: String::new(),
                    config: Map::from_iter([("iterations".to_string(), json!(9))]),
                    next_steps: vec![],
                    condition: None,
                    error_handler: None,
                },
            ],
        )
    }

    #[tokio::test]
    async fn conditional_picks_the_then_branch() {
        let (engine, _, _) = engine();
        let workflow = conditional_workflow();
        engine.register(&workflow).await.unwrap();

        let execution = engine
            .execute(
                workflow.id,
                Map::from_iter([("retries".to_string(), json!(1))]),
            )
            .await
            .unwrap();

        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert!(execution.step_results.contains_key("low"));
        assert!(!execution.step_results.contains_key("high"));
    }

    #[tokio::test]
    async fn conditional_picks_the_else_branch() {
        let (engine, _, _) = engine();
        let workflow = conditional_workflow();
        engine.register(&workflow).await.unwrap();

        let execution = engine
            .execute(
                workflow.id,
                Map::from_iter([("retries".to_string(), json!(7))]),
            )
            .await
            .unwrap();

        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert!(execution.step_results.contains_key("high"));
    }

    #[tokio::test]
    async fn malformed_conditions_fail_the_run_without_evaluation() {
        let (engine, _, _) = engine();
        let mut workflow = conditional_workflow();
        workflow.steps[0].condition = Some("__import__('os')".into());
        engine.register(&workflow).await.unwrap();

        let execution = engine.execute(workflow.id, Map::new()).await.unwrap();
        assert_eq!(execution.status, WorkflowStatus::Failed);
        assert!(execution.error.unwrap().contains("condition"));
    }

    #[tokio::test]
    async fn agent_call_routes_a_task_message() {
        let (engine, registry, delivery) = engine();
        registry
            .register(
                crate::agent::Agent::new(
                    AgentId::try_new("u1".to_string()).unwrap(),
                    "u1",
                    crate::domain_types::RoleName::try_new("general".to_string()).unwrap(),
                )
                .activated(),
            )
            .unwrap();
        let mut queue = delivery.register_queue(AgentId::try_new("u1".to_string()).unwrap(), 8);

        let workflow = Workflow::new(
            "call",
            vec![WorkflowStep {
                id: "call".into(),
                kind: StepKind::AgentCall,
                name: String::new(),
                config: Map::from_iter([
                    ("agent_id".to_string(), json!("u1")),
                    ("message".to_string(), json!({"do": "x"})),
                ]),
                next_steps: vec![],
                condition: None,
                error_handler: None,
            }],
        );
        engine.register(&workflow).await.unwrap();

        let execution = engine.execute(workflow.id, Map::new()).await.unwrap();
        assert_eq!(execution.status, WorkflowStatus::Completed);

        let message = queue.recv().await.unwrap();
        assert_eq!(message.message_type, MessageType::Task);
        assert_eq!(message.content, json!({"do": "x"}));
        assert_eq!(message.metadata["workflow_step"], "call");
    }

    #[tokio::test]
    async fn failures_jump_to_the_error_handler() {
        let (engine, _, _) = engine();
        let workflow = Workflow::new(
            "recovering",
            vec![
                WorkflowStep {
                    id: "broken".into(),
                    kind: StepKind::AgentCall,
                    name: String::new(),
                    config: Map::from_iter([("agent_id".to_string(), json!("ghost"))]),
                    next_steps: vec![],
                    condition: None,
                    error_handler: Some("recover".into()),
                },
                WorkflowStep {
                    id: "recover".into(),
                    kind: StepKind::Loop,
                    name: String::new(),
                    config: Map::new(),
                    next_steps: vec![],
                    condition: None,
                    error_handler: None,
                },
            ],
        );
        engine.register(&workflow).await.unwrap();

        let execution = engine.execute(workflow.id, Map::new()).await.unwrap();
        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert_eq!(execution.step_results["broken"]["status"], "failed");
        assert!(execution.step_results.contains_key("recover"));
    }

    #[tokio::test]
    async fn missing_workflow_is_not_found() {
        let (engine, _, _) = engine();
        assert!(matches!(
            engine.execute(WorkflowId::generate(), Map::new()).await,
            Err(CoordinationError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn register_and_list_round_trips() {
        let (engine, _, _) = engine();
        let workflow = conditional_workflow();
        engine.register(&workflow).await.unwrap();

        let listed = engine.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "branching");

        let loaded = engine.get(workflow.id).await.unwrap().unwrap();
        assert_eq!(loaded.steps.len(), 3);
    }
}
