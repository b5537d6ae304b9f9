//! Agent registry
//!
//! Authoritative index of agents by identifier and by DID, with O(1) lookup
//! on both maps. The registry exclusively owns [`Agent`] records; every
//! successful mutation emits a lifecycle event.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::agent::{Agent, AgentPatch, AgentStatus};
use crate::domain_types::{AgentId, CapabilityName, Did, RoleName};
use crate::error::{CoordinationError, Result};
use crate::event_payload;
use crate::events::{Event, EventBus, EventKind};

/// Authoritative agent index
pub struct AgentRegistry {
    agents: DashMap<AgentId, Agent>,
    by_did: DashMap<Did, AgentId>,
    event_bus: Arc<EventBus>,
    max_agents: usize,
}

impl AgentRegistry {
    /// Creates a registry capped at `max_agents` registrations
    #[must_use]
    pub fn new(event_bus: Arc<EventBus>, max_agents: usize) -> Self {
        Self {
            agents: DashMap::new(),
            by_did: DashMap::new(),
            event_bus,
            max_agents,
        }
    }

    /// Registers an agent
    ///
    /// # Errors
    ///
    /// `DuplicateIdentifier` when the id or DID is already registered;
    /// `RateLimited` when the registry is at its hard cap.
    pub fn register(&self, agent: Agent) -> Result<()> {
        if self.agents.len() >= self.max_agents {
            return Err(CoordinationError::RateLimited {
                reason: format!("registry is at capacity ({} agents)", self.max_agents),
            });
        }
        if self.agents.contains_key(&agent.id) {
            return Err(CoordinationError::DuplicateIdentifier {
                id: agent.id.to_string(),
            });
        }
        if let Some(did) = &agent.did {
            if self.by_did.contains_key(did) {
                return Err(CoordinationError::DuplicateIdentifier {
                    id: did.to_string(),
                });
            }
            self.by_did.insert(did.clone(), agent.id.clone());
        }

        let snapshot = serde_json::to_value(&agent).unwrap_or_default();
        info!(agent_id = %agent.id, name = %agent.name, "registered agent");
        self.agents.insert(agent.id.clone(), agent.clone());

        self.event_bus.emit(
            Event::new(
                EventKind::AgentCreated,
                event_payload! {
                    "agent_id" => agent.id.to_string(),
                    "agent" => snapshot,
                },
            )
            .with_source("registry"),
        );
        Ok(())
    }

    /// Fetches an agent by identifier
    #[must_use]
    pub fn get(&self, agent_id: &AgentId) -> Option<Agent> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    /// Fetches an agent by DID
    #[must_use]
    pub fn get_by_did(&self, did: &Did) -> Option<Agent> {
        let agent_id = self.by_did.get(did)?.value().clone();
        self.get(&agent_id)
    }

    /// Applies a declared-attribute patch and refreshes `last_active`
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown identifier; `InvalidParams` when the patch
    /// carries non-finite metrics.
    pub fn update(&self, agent_id: &AgentId, patch: AgentPatch) -> Result<()> {
        if let Some(metrics) = &patch.performance_metrics {
            if !metrics.is_finite() {
                return Err(CoordinationError::InvalidParams {
                    reason: "performance metrics must be finite".into(),
                });
            }
        }

        let mut entry = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| CoordinationError::not_found("agent", agent_id.to_string()))?;
        let agent = entry.value_mut();

        let patch_snapshot = serde_json::to_value(&patch).unwrap_or_default();
        if let Some(name) = patch.name {
            agent.name = name;
        }
        if let Some(role) = patch.role {
            agent.role = role;
        }
        if let Some(status) = patch.status {
            agent.status = status;
        }
        if let Some(capabilities) = patch.capabilities {
            agent.capabilities = capabilities;
        }
        if let Some(public_key) = patch.public_key {
            agent.public_key = Some(public_key);
        }
        if let Some(state) = patch.state {
            agent.state.extend(state);
        }
        if let Some(metrics) = patch.performance_metrics {
            agent.performance_metrics = metrics;
        }
        if let Some(security_level) = patch.security_level {
            agent.security_level = security_level;
        }
        if let Some(ai_provider) = patch.ai_provider {
            agent.ai_provider = ai_provider;
        }
        if let Some(manifest_version) = patch.manifest_version {
            agent.manifest_version = Some(manifest_version);
        }
        agent.touch();
        drop(entry);

        debug!(agent_id = %agent_id, "updated agent");
        self.event_bus.emit(
            Event::new(
                EventKind::AgentUpdated,
                event_payload! {
                    "agent_id" => agent_id.to_string(),
                    "updates" => patch_snapshot,
                },
            )
            .with_source("registry"),
        );
        Ok(())
    }

    /// Unregisters an agent; idempotent at the observable-effect level
    ///
    /// Returns whether a record was actually removed. The second call for
    /// the same identifier returns `false` without emitting an event.
    pub fn unregister(&self, agent_id: &AgentId) -> bool {
        let Some((_, agent)) = self.agents.remove(agent_id) else {
            return false;
        };
        if let Some(did) = &agent.did {
            self.by_did.remove(did);
        }

        info!(agent_id = %agent_id, "unregistered agent");
        self.event_bus.emit(
            Event::new(
                EventKind::AgentDeleted,
                event_payload! {"agent_id" => agent_id.to_string()},
            )
            .with_source("registry"),
        );
        true
    }

    /// Lists agents, optionally filtered by status
    #[must_use]
    pub fn list(&self, status: Option<AgentStatus>) -> Vec<Agent> {
        self.agents
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|agent| status.is_none_or(|wanted| agent.status == wanted))
            .collect()
    }

    /// Lists agents advertising `capability`
    #[must_use]
    pub fn list_by_capability(&self, capability: &CapabilityName) -> Vec<Agent> {
        self.agents
            .iter()
            .filter(|entry| entry.value().has_capability(capability))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Lists agents with `role`
    #[must_use]
    pub fn list_by_role(&self, role: &RoleName) -> Vec<Agent> {
        self.agents
            .iter()
            .filter(|entry| entry.value().role == *role)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Counts agents, optionally filtered by status
    #[must_use]
    pub fn count(&self, status: Option<AgentStatus>) -> usize {
        match status {
            None => self.agents.len(),
            Some(wanted) => self
                .agents
                .iter()
                .filter(|entry| entry.value().status == wanted)
                .count(),
        }
    }

    /// Whether an agent is registered under `agent_id`
    #[must_use]
    pub fn exists(&self, agent_id: &AgentId) -> bool {
        self.agents.contains_key(agent_id)
    }
}
