//! In-process event bus
//!
//! Publish/subscribe fan-out with a bounded history ring. Emission never
//! blocks on a subscriber: delivery rides a broadcast channel, and a lagging
//! receiver misses events rather than stalling the emitter.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::domain_types::{CorrelationId, Timestamp};

/// Number of events retained in the history ring
const DEFAULT_HISTORY: usize = 1000;
/// Broadcast channel capacity per bus
const CHANNEL_CAPACITY: usize = 256;

/// Closed enumeration of event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// An agent was registered
    #[serde(rename = "agent.created")]
    AgentCreated,
    /// An agent record was patched
    #[serde(rename = "agent.updated")]
    AgentUpdated,
    /// An agent was unregistered
    #[serde(rename = "agent.deleted")]
    AgentDeleted,
    /// A message was dispatched to an agent's delivery channel
    #[serde(rename = "message.sent")]
    MessageSent,
    /// A message arrived at the core
    #[serde(rename = "message.received")]
    MessageReceived,
    /// A message finished processing
    #[serde(rename = "message.processed")]
    MessageProcessed,
    /// An A2A task was created
    #[serde(rename = "task.created")]
    TaskCreated,
    /// An A2A task reached `completed`
    #[serde(rename = "task.completed")]
    TaskCompleted,
    /// An A2A task reached `failed`
    #[serde(rename = "task.failed")]
    TaskFailed,
    /// A workflow execution started
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    /// A workflow execution finished
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    /// A message was suspended awaiting operator approval
    #[serde(rename = "hitl.approval_required")]
    HitlApprovalRequired,
    /// An operator approved a suspended message
    #[serde(rename = "hitl.approved")]
    HitlApproved,
    /// An operator rejected a suspended message, or it expired
    #[serde(rename = "hitl.rejected")]
    HitlRejected,
    /// A Q-learning update was applied
    #[serde(rename = "rl.reward")]
    RlReward,
    /// A Q-table was replaced wholesale
    #[serde(rename = "rl.model_updated")]
    RlModelUpdated,
    /// Peer Q-tables were averaged
    #[serde(rename = "frl.aggregation")]
    FrlAggregation,
    /// A manifest was created, patched, or deleted
    #[serde(rename = "manifest.updated")]
    ManifestUpdated,
}

/// A single observation on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// What happened
    pub kind: EventKind,
    /// Structured details about the occurrence
    pub payload: Map<String, Value>,
    /// When the event was emitted
    pub timestamp: Timestamp,
    /// Component that emitted the event
    pub source: Option<String>,
    /// Correlates the event with the originating message
    pub correlation_id: Option<CorrelationId>,
}

impl Event {
    /// Creates an event with the current timestamp and no source
    #[must_use]
    pub fn new(kind: EventKind, payload: Map<String, Value>) -> Self {
        Self {
            kind,
            payload,
            timestamp: Timestamp::now(),
            source: None,
            correlation_id: None,
        }
    }

    /// Tags the event with its emitting component
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Threads a correlation identifier through the event
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: Option<CorrelationId>) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

/// Pub/sub bus with bounded history
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    history: Mutex<VecDeque<Event>>,
    max_history: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus retaining the default number of events
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    /// Creates a bus retaining at most `max_history` events
    #[must_use]
    pub fn with_history(max_history: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(max_history.min(DEFAULT_HISTORY))),
            max_history,
        }
    }

    /// Subscribes to every subsequent emission
    ///
    /// Receivers that fall behind the channel capacity observe a `Lagged`
    /// error and skip ahead; emission is never delayed on their behalf.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Records the event in history and fans it out to subscribers
    pub fn emit(&self, event: Event) {
        {
            let mut history = self.history.lock().expect("event history lock poisoned");
            if history.len() == self.max_history {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // A send error only means nobody is listening right now.
        let receivers = self.sender.send(event.clone()).unwrap_or(0);
        debug!(kind = ?event.kind, receivers, "emitted event");
    }

    /// The most recent events, optionally filtered by kind, oldest first
    #[must_use]
    pub fn history(&self, kind: Option<EventKind>, limit: usize) -> Vec<Event> {
        let history = self.history.lock().expect("event history lock poisoned");
        let matching: Vec<Event> = history
            .iter()
            .filter(|event| kind.is_none_or(|k| event.kind == k))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    /// Empties the history ring
    pub fn clear_history(&self) {
        self.history
            .lock()
            .expect("event history lock poisoned")
            .clear();
    }
}

/// Builds an event payload from `(key, value)` pairs
#[macro_export]
macro_rules! event_payload {
    ($($key:literal => $value:expr),* $(,)?) => {{
        let mut payload = ::serde_json::Map::new();
        $(payload.insert($key.to_string(), ::serde_json::json!($value));)*
        payload
    }};
}
