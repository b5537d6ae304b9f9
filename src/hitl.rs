//! Human-in-the-loop middleware
//!
//! Messages flagged as sensitive are parked in the approval queue and the
//! calling task suspends until an operator decides, the deadline passes, or
//! the caller is cancelled out of band. The queue is authoritative on
//! status transitions: `pending` exits exactly once, and terminal states
//! are immutable.
//!
//! Waiting is wakeup-driven: each request carries a notify primitive that
//! `approve`/`reject`/expiry signal. A background sweep transitions
//! past-deadline requests nobody is awaiting.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::domain_types::{AgentId, ApprovalId, Timestamp};
use crate::event_payload;
use crate::events::{Event, EventBus, EventKind};
use crate::message::Message;

/// Cadence of the background expiry sweep
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);
/// Reason recorded when a request expires
const TIMEOUT_REASON: &str = "timeout";

/// Approval request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    /// Awaiting an operator decision
    Pending,
    /// Approved; the message proceeds (terminal)
    Approved,
    /// Rejected; the message is dropped (terminal)
    Rejected,
    /// Deadline passed without a decision (terminal)
    Expired,
    /// Escalated to a higher authority (terminal)
    Escalated,
}

impl ApprovalStatus {
    /// Whether the status is terminal
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A message parked for operator review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request identifier
    pub id: ApprovalId,
    /// The gated message, returned unchanged on approval
    pub message: Message,
    /// Why the message was gated
    pub reason: String,
    /// Who sent the gated message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_id: Option<AgentId>,
    /// Current status
    pub status: ApprovalStatus,
    /// When the request was created
    pub created_at: Timestamp,
    /// Deadline after which the request expires; `None` waits forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Timestamp>,
    /// Operator that approved or rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    /// Operator-supplied rejection reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// Free-form metadata (decision timestamps, escalation notes)
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

struct ApprovalEntry {
    request: ApprovalRequest,
    notify: Arc<Notify>,
}

/// Authoritative queue of approval requests
pub struct ApprovalQueue {
    entries: DashMap<ApprovalId, ApprovalEntry>,
    default_timeout_seconds: u64,
}

impl ApprovalQueue {
    /// Creates a queue whose default deadline is `default_timeout_seconds`
    /// from request creation; `0` means no deadline
    #[must_use]
    pub fn new(default_timeout_seconds: u64) -> Self {
        Self {
            entries: DashMap::new(),
            default_timeout_seconds,
        }
    }

    /// Parks a message and returns the pending request
    pub fn add(
        &self,
        message: Message,
        reason: impl Into<String>,
        requester_id: Option<AgentId>,
        timeout_seconds: Option<u64>,
    ) -> ApprovalRequest {
        let timeout = timeout_seconds.unwrap_or(self.default_timeout_seconds);
        let created_at = Timestamp::now();
        let request = ApprovalRequest {
            id: ApprovalId::generate(),
            message,
            reason: reason.into(),
            requester_id,
            status: ApprovalStatus::Pending,
            created_at,
            deadline: (timeout > 0).then(|| created_at.plus_secs(timeout)),
            approver: None,
            rejection_reason: None,
            metadata: serde_json::Map::new(),
        };
        info!(request_id = %request.id, message_id = %request.message.id, "queued approval request");
        self.entries.insert(
            request.id,
            ApprovalEntry {
                request: request.clone(),
                notify: Arc::new(Notify::new()),
            },
        );
        request
    }

    /// Fetches a request snapshot
    #[must_use]
    pub fn get(&self, id: ApprovalId) -> Option<ApprovalRequest> {
        self.entries.get(&id).map(|entry| entry.request.clone())
    }

    /// Approves a pending request; a no-op returning `false` otherwise
    pub fn approve(&self, id: ApprovalId, approver: impl Into<String>) -> bool {
        self.decide(id, |request| {
            request.status = ApprovalStatus::Approved;
            request.approver = Some(approver.into());
            request.metadata.insert(
                "approved_at".to_string(),
                serde_json::to_value(Timestamp::now()).unwrap_or(Value::Null),
            );
        })
    }

    /// Rejects a pending request; a no-op returning `false` otherwise
    pub fn reject(
        &self,
        id: ApprovalId,
        approver: impl Into<String>,
        reason: impl Into<String>,
    ) -> bool {
        self.decide(id, |request| {
            request.status = ApprovalStatus::Rejected;
            request.approver = Some(approver.into());
            request.rejection_reason = Some(reason.into());
            request.metadata.insert(
                "rejected_at".to_string(),
                serde_json::to_value(Timestamp::now()).unwrap_or(Value::Null),
            );
        })
    }

    /// Expires a pending request; a no-op returning `false` otherwise
    pub fn expire(&self, id: ApprovalId) -> bool {
        self.decide(id, |request| {
            request.status = ApprovalStatus::Expired;
            request.rejection_reason = Some(TIMEOUT_REASON.to_string());
        })
    }

    fn decide(&self, id: ApprovalId, apply: impl FnOnce(&mut ApprovalRequest)) -> bool {
        let Some(mut entry) = self.entries.get_mut(&id) else {
            return false;
        };
        if entry.request.status.is_terminal() {
            warn!(request_id = %id, status = ?entry.request.status, "request is not pending");
            return false;
        }
        apply(&mut entry.request);
        entry.notify.notify_waiters();
        true
    }

    /// Every request still pending
    #[must_use]
    pub fn list_pending(&self) -> Vec<ApprovalRequest> {
        self.entries
            .iter()
            .filter(|entry| entry.request.status == ApprovalStatus::Pending)
            .map(|entry| entry.request.clone())
            .collect()
    }

    /// Expires every pending request whose deadline has passed
    ///
    /// Returns the ids that transitioned.
    pub fn cleanup_expired(&self) -> Vec<ApprovalId> {
        let overdue: Vec<ApprovalId> = self
            .entries
            .iter()
            .filter(|entry| {
                entry.request.status == ApprovalStatus::Pending
                    && entry.request.deadline.is_some_and(|deadline| deadline.is_past())
            })
            .map(|entry| entry.request.id)
            .collect();
        overdue
            .into_iter()
            .filter(|id| self.expire(*id))
            .collect()
    }

    fn waiter(&self, id: ApprovalId) -> Option<Arc<Notify>> {
        self.entries.get(&id).map(|entry| Arc::clone(&entry.notify))
    }
}

/// Outcome of pushing a message through the HITL gate
#[derive(Debug, Clone)]
pub enum HitlOutcome {
    /// Not gated, or approved: the message proceeds unchanged
    Delivered(Message),
    /// Rejected or expired: the message is dropped
    Rejected {
        /// Operator reason, or `"timeout"` on expiry
        reason: String,
    },
}

/// Middleware gating sensitive messages on operator approval
pub struct HitlMiddleware {
    queue: Arc<ApprovalQueue>,
    event_bus: Arc<EventBus>,
    enabled: bool,
}

impl HitlMiddleware {
    /// Wires the middleware; `config.hitl_enabled = false` makes
    /// [`HitlMiddleware::process`] a pass-through
    #[must_use]
    pub fn new(
        queue: Arc<ApprovalQueue>,
        event_bus: Arc<EventBus>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            queue,
            event_bus,
            enabled: config.hitl_enabled,
        }
    }

    /// The queue this middleware parks messages in
    #[must_use]
    pub fn queue(&self) -> &Arc<ApprovalQueue> {
        &self.queue
    }

    /// Spawns the background sweep that expires overdue requests
    ///
    /// The sweep only matters for requests nobody is awaiting; an awaiting
    /// caller observes its own deadline.
    pub fn spawn_sweeper(queue: Arc<ApprovalQueue>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                for id in queue.cleanup_expired() {
                    debug!(request_id = %id, "expired approval request");
                }
            }
        })
    }

    /// Gates a message, suspending until the approval reaches a terminal
    /// state
    ///
    /// Ungated messages pass through untouched. For gated messages the
    /// middleware emits `hitl.approval_required`, parks the message, and
    /// waits; the emission order (`approval_required` before the decision
    /// event) is fixed. With no deadline configured and no operator
    /// decision this future never resolves; the caller owns cancellation.
    pub async fn process(&self, message: Message) -> HitlOutcome {
        if !self.enabled || !message.is_gated() {
            return HitlOutcome::Delivered(message);
        }

        let reason = message
            .metadata
            .get("approval_reason")
            .and_then(Value::as_str)
            .unwrap_or("message flagged for human approval")
            .to_string();
        let requester = message.sender_id.clone();
        let correlation = message.correlation_id.clone();
        let message_id = message.id;
        let request = self.queue.add(message, reason.clone(), requester, None);

        self.event_bus.emit(
            Event::new(
                EventKind::HitlApprovalRequired,
                event_payload! {
                    "request_id" => request.id.to_string(),
                    "message_id" => message_id.to_string(),
                    "reason" => reason,
                },
            )
            .with_source("hitl")
            .with_correlation(correlation.clone()),
        );

        self.wait_for_decision(request.id, request.deadline).await
    }

    async fn wait_for_decision(
        &self,
        request_id: ApprovalId,
        deadline: Option<Timestamp>,
    ) -> HitlOutcome {
        loop {
            // Arm the wakeup before reading status so a decision landing
            // between the two is not missed.
            let Some(notify) = self.queue.waiter(request_id) else {
                return HitlOutcome::Rejected {
                    reason: "approval request vanished".to_string(),
                };
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let Some(request) = self.queue.get(request_id) else {
                return HitlOutcome::Rejected {
                    reason: "approval request vanished".to_string(),
                };
            };
            match request.status {
                ApprovalStatus::Pending => {}
                ApprovalStatus::Approved => {
                    self.event_bus.emit(
                        Event::new(
                            EventKind::HitlApproved,
                            event_payload! {
                                "request_id" => request.id.to_string(),
                                "message_id" => request.message.id.to_string(),
                                "approved_by" => request.approver,
                            },
                        )
                        .with_source("hitl"),
                    );
                    return HitlOutcome::Delivered(request.message);
                }
                ApprovalStatus::Rejected | ApprovalStatus::Escalated => {
                    let reason = request
                        .rejection_reason
                        .unwrap_or_else(|| "rejected".to_string());
                    self.emit_rejected(request.id, &reason);
                    return HitlOutcome::Rejected { reason };
                }
                ApprovalStatus::Expired => {
                    self.emit_rejected(request.id, TIMEOUT_REASON);
                    return HitlOutcome::Rejected {
                        reason: TIMEOUT_REASON.to_string(),
                    };
                }
            }

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep(deadline.until()) => {
                            // Deadline reached from this waiter's clock; the
                            // transition is a no-op if an operator won the race.
                            self.queue.expire(request_id);
                        }
                    }
                }
                None => notified.await,
            }
        }
    }

    fn emit_rejected(&self, request_id: ApprovalId, reason: &str) {
        self.event_bus.emit(
            Event::new(
                EventKind::HitlRejected,
                event_payload! {
                    "request_id" => request_id.to_string(),
                    "reason" => reason,
                },
            )
            .with_source("hitl"),
        );
    }
}
