//! Agent data model
//!
//! The registry-owned record for a named, addressable participant: identity,
//! declared capabilities, live performance metrics, and free-form state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain_types::{AgentId, CapabilityName, Did, RoleName, Timestamp};

/// Lifecycle status of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered but not yet accepting work
    Pending,
    /// Accepting work
    Active,
    /// Temporarily not accepting work
    Inactive,
    /// Administratively blocked
    Suspended,
}

/// Numeric performance metrics tracked per agent
///
/// All values are finite; the registry refuses patches carrying NaN or
/// infinite metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Fraction of dispatches that succeeded, in `[0, 1]`
    pub success_rate: f64,
    /// Mean observed response time in milliseconds
    pub response_time: f64,
    /// Observed learning-curve slope
    pub learning_rate: f64,
    /// Peer-collaboration score
    pub collaboration_score: f64,
    /// Work delivered per unit cost
    pub cost_efficiency: f64,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            success_rate: 0.0,
            response_time: 0.0,
            learning_rate: 0.0,
            collaboration_score: 0.0,
            cost_efficiency: 0.0,
        }
    }
}

impl PerformanceMetrics {
    /// Whether every metric is a finite number
    #[must_use]
    pub fn is_finite(&self) -> bool {
        [
            self.success_rate,
            self.response_time,
            self.learning_rate,
            self.collaboration_score,
            self.cost_efficiency,
        ]
        .iter()
        .all(|value| value.is_finite())
    }
}

/// An entry in the agent's ordered memory log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// When the entry was recorded
    pub recorded_at: Timestamp,
    /// Opaque entry body
    pub entry: Map<String, Value>,
}

/// Registry-owned agent record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Stable opaque identifier, unique in the registry
    pub id: AgentId,
    /// Optional decentralized identifier, unique when present
    pub did: Option<Did>,
    /// Human-readable name
    pub name: String,
    /// Role tag
    pub role: RoleName,
    /// Lifecycle status
    pub status: AgentStatus,
    /// Declared capability tags
    pub capabilities: Vec<CapabilityName>,
    /// Optional public-key material (opaque to the core)
    pub public_key: Option<String>,
    /// Free-form state mapping
    pub state: Map<String, Value>,
    /// Ordered memory entries
    pub memory: Vec<MemoryEntry>,
    /// Live performance metrics
    pub performance_metrics: PerformanceMetrics,
    /// Security classification tag
    pub security_level: String,
    /// Preferred AI provider tag
    pub ai_provider: String,
    /// Registration time
    pub created_at: Timestamp,
    /// Last mutation time; never earlier than `created_at`
    pub last_active: Timestamp,
    /// Version of the agent's manifest, when one exists
    pub manifest_version: Option<String>,
}

impl Agent {
    /// Creates an agent in `pending` status with default metrics
    #[must_use]
    pub fn new(id: AgentId, name: impl Into<String>, role: RoleName) -> Self {
        let now = Timestamp::now();
        Self {
            id,
            did: None,
            name: name.into(),
            role,
            status: AgentStatus::Pending,
            capabilities: Vec::new(),
            public_key: None,
            state: Map::new(),
            memory: Vec::new(),
            performance_metrics: PerformanceMetrics::default(),
            security_level: "standard".to_string(),
            ai_provider: "openai".to_string(),
            created_at: now,
            last_active: now,
            manifest_version: None,
        }
    }

    /// Attaches a DID
    #[must_use]
    pub fn with_did(mut self, did: Did) -> Self {
        self.did = Some(did);
        self
    }

    /// Replaces the capability set
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<CapabilityName>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Marks the agent active
    #[must_use]
    pub fn activated(mut self) -> Self {
        self.status = AgentStatus::Active;
        self
    }

    /// Whether the agent advertises `capability`
    #[must_use]
    pub fn has_capability(&self, capability: &CapabilityName) -> bool {
        self.capabilities.contains(capability)
    }

    /// Refreshes `last_active`, keeping it strictly monotonic
    pub fn touch(&mut self) {
        self.last_active = Timestamp::after(self.last_active);
    }

    /// Appends a memory entry stamped now
    pub fn remember(&mut self, entry: Map<String, Value>) {
        self.memory.push(MemoryEntry {
            recorded_at: Timestamp::now(),
            entry,
        });
    }
}

/// Declared-attribute patch applied by [`crate::registry::AgentRegistry::update`]
///
/// Only the attributes named here can be patched; everything else on the
/// record is owned by its originating subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentPatch {
    /// New human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New role tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<RoleName>,
    /// New lifecycle status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AgentStatus>,
    /// Replacement capability set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<CapabilityName>>,
    /// Replacement public-key material
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Merged into the free-form state mapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Map<String, Value>>,
    /// Replacement performance metrics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_metrics: Option<PerformanceMetrics>,
    /// New security classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_level: Option<String>,
    /// New preferred AI provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_provider: Option<String>,
    /// New manifest version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capability(tag: &str) -> CapabilityName {
        CapabilityName::try_new(tag.to_string()).unwrap()
    }

    #[test]
    fn new_agent_starts_pending_with_default_metrics() {
        let agent = Agent::new(
            AgentId::try_new("u1".to_string()).unwrap(),
            "alpha",
            RoleName::try_new("general".to_string()).unwrap(),
        );
        assert_eq!(agent.status, AgentStatus::Pending);
        assert_eq!(agent.performance_metrics.success_rate, 0.0);
        assert_eq!(agent.created_at, agent.last_active);
    }

    #[test]
    fn touch_advances_last_active() {
        let mut agent = Agent::new(
            AgentId::try_new("u1".to_string()).unwrap(),
            "alpha",
            RoleName::try_new("general".to_string()).unwrap(),
        );
        let before = agent.last_active;
        agent.touch();
        assert!(agent.last_active > before);
        assert!(agent.last_active >= agent.created_at);
    }

    #[test]
    fn capability_membership() {
        let agent = Agent::new(
            AgentId::try_new("u1".to_string()).unwrap(),
            "alpha",
            RoleName::try_new("general".to_string()).unwrap(),
        )
        .with_capabilities(vec![capability("summarize")]);
        assert!(agent.has_capability(&capability("summarize")));
        assert!(!agent.has_capability(&capability("translate")));
    }

    #[test]
    fn non_finite_metrics_are_detected() {
        let mut metrics = PerformanceMetrics::default();
        assert!(metrics.is_finite());
        metrics.response_time = f64::NAN;
        assert!(!metrics.is_finite());
    }
}
