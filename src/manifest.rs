//! Capability manifests
//!
//! The manifest is the authoritative document mapping an agent to its
//! capabilities, schemas, metrics, and endpoints. The service mirrors the
//! backing store in an in-process cache that is invalidated on every write,
//! and answers the two queries the router depends on: by capability and by
//! metric thresholds.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::agent::Agent;
use crate::domain_types::{AgentId, CapabilityName, Did, Timestamp};
use crate::error::{CoordinationError, Result};
use crate::event_payload;
use crate::events::{Event, EventBus, EventKind};
use crate::storage::Storage;

/// Storage key prefix for manifests
const KEY_PREFIX: &str = "manifest:";

/// Well-known metric: expected cost per request, in `[0, ∞)`
pub const METRIC_COST_RATE: &str = "cost_rate";
/// Well-known metric: expected latency in milliseconds, in `[0, ∞)`
pub const METRIC_LATENCY_MS: &str = "latency_ms";
/// Well-known metric: success fraction, in `[0, 1]`
pub const METRIC_SUCCESS_RATE: &str = "success_rate";

/// Capability + metric document for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Owning agent
    pub agent_id: AgentId,
    /// Owning agent's DID, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<Did>,
    /// Semantic version of the manifest
    pub version: String,
    /// Advertised capability tags
    pub capabilities: Vec<CapabilityName>,
    /// Optional input/output schemas keyed by capability
    #[serde(default)]
    pub schemas: Map<String, Value>,
    /// Observed metrics; see the `METRIC_*` keys
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Endpoint mapping (opaque to the core)
    #[serde(default)]
    pub endpoints: Map<String, Value>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Creation time
    pub created_at: Timestamp,
    /// Last update time; never earlier than `created_at`
    pub updated_at: Timestamp,
}

impl Manifest {
    /// A metric value, when present and finite
    #[must_use]
    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied().filter(|value| value.is_finite())
    }

    /// Whether the manifest advertises `capability`
    #[must_use]
    pub fn has_capability(&self, capability: &CapabilityName) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Incremental manifest patch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestPatch {
    /// New semantic version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Replacement capability set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<CapabilityName>>,
    /// Schemas merged into the existing mapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<Map<String, Value>>,
    /// Metrics merged into the existing mapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, f64>>,
    /// Endpoints merged into the existing mapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Map<String, Value>>,
    /// Metadata merged into the existing mapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Data supplied when creating or replacing a manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestData {
    /// Semantic version; defaults to `1.0.0`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Capability tags; defaults to the agent's declared capabilities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<CapabilityName>>,
    /// Input/output schemas keyed by capability
    #[serde(default)]
    pub schemas: Map<String, Value>,
    /// Initial metrics
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Endpoint mapping
    #[serde(default)]
    pub endpoints: Map<String, Value>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Manifest store with a write-through cache
pub struct ManifestService {
    storage: Arc<dyn Storage>,
    cache: DashMap<AgentId, Manifest>,
    event_bus: Arc<EventBus>,
}

impl ManifestService {
    /// Creates a service over the given backing store
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, event_bus: Arc<EventBus>) -> Self {
        Self {
            storage,
            cache: DashMap::new(),
            event_bus,
        }
    }

    fn key(agent_id: &AgentId) -> String {
        format!("{KEY_PREFIX}{agent_id}")
    }

    /// Creates or wholesale-replaces the agent's manifest
    ///
    /// # Errors
    ///
    /// `InvalidParams` when a supplied metric is non-finite or out of its
    /// documented range; transient storage failures propagate.
    pub async fn create_or_replace(&self, agent: &Agent, data: ManifestData) -> Result<Manifest> {
        validate_metrics(&data.metrics)?;
        let now = Timestamp::now();
        let manifest = Manifest {
            agent_id: agent.id.clone(),
            did: agent.did.clone(),
            version: data.version.unwrap_or_else(|| "1.0.0".to_string()),
            capabilities: data
                .capabilities
                .unwrap_or_else(|| agent.capabilities.clone()),
            schemas: data.schemas,
            metrics: data.metrics,
            endpoints: data.endpoints,
            metadata: data.metadata,
            created_at: now,
            updated_at: now,
        };

        self.persist(&manifest).await?;
        info!(agent_id = %agent.id, version = %manifest.version, "created manifest");
        Ok(manifest)
    }

    /// Fetches the manifest for `agent_id`, via the cache when warm
    pub async fn get(&self, agent_id: &AgentId) -> Result<Option<Manifest>> {
        if let Some(cached) = self.cache.get(agent_id) {
            return Ok(Some(cached.value().clone()));
        }
        let Some(document) = self.storage.get(&Self::key(agent_id)).await? else {
            return Ok(None);
        };
        let manifest: Manifest = serde_json::from_value(document).map_err(|err| {
            CoordinationError::Fatal {
                reason: format!("corrupt manifest document for {agent_id}: {err}"),
            }
        })?;
        self.cache.insert(agent_id.clone(), manifest.clone());
        Ok(Some(manifest))
    }

    /// Applies an incremental patch, strictly advancing `updated_at`
    ///
    /// # Errors
    ///
    /// `NotFound` when the agent has no manifest; `InvalidParams` on bad
    /// metrics.
    pub async fn update(&self, agent_id: &AgentId, patch: ManifestPatch) -> Result<Manifest> {
        if let Some(metrics) = &patch.metrics {
            validate_metrics(metrics)?;
        }
        let mut manifest = self
            .get(agent_id)
            .await?
            .ok_or_else(|| CoordinationError::not_found("manifest", agent_id.to_string()))?;

        if let Some(version) = patch.version {
            manifest.version = version;
        }
        if let Some(capabilities) = patch.capabilities {
            manifest.capabilities = capabilities;
        }
        if let Some(schemas) = patch.schemas {
            manifest.schemas.extend(schemas);
        }
        if let Some(metrics) = patch.metrics {
            manifest.metrics.extend(metrics);
        }
        if let Some(endpoints) = patch.endpoints {
            manifest.endpoints.extend(endpoints);
        }
        if let Some(metadata) = patch.metadata {
            manifest.metadata.extend(metadata);
        }
        manifest.updated_at = Timestamp::after(manifest.updated_at);

        self.persist(&manifest).await?;
        debug!(agent_id = %agent_id, "updated manifest");
        Ok(manifest)
    }

    /// Deletes the manifest; returns whether one existed
    pub async fn delete(&self, agent_id: &AgentId) -> Result<bool> {
        self.cache.remove(agent_id);
        let deleted = self.storage.delete(&Self::key(agent_id)).await?;
        if deleted {
            info!(agent_id = %agent_id, "deleted manifest");
            self.event_bus.emit(
                Event::new(
                    EventKind::ManifestUpdated,
                    event_payload! {
                        "agent_id" => agent_id.to_string(),
                        "deleted" => true,
                    },
                )
                .with_source("manifest"),
            );
        }
        Ok(deleted)
    }

    /// Every manifest advertising `capability`, in unspecified order
    pub async fn find_by_capability(&self, capability: &CapabilityName) -> Result<Vec<Manifest>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|manifest| manifest.has_capability(capability))
            .collect())
    }

    /// Manifests satisfying every supplied metric constraint
    ///
    /// Constraints apply conjunctively. A manifest missing a constrained
    /// metric fails that constraint: absent metrics read as `∞` against
    /// upper bounds and `0` against lower bounds.
    pub async fn find_by_metrics(
        &self,
        max_cost: Option<f64>,
        max_latency: Option<f64>,
        min_success: Option<f64>,
    ) -> Result<Vec<Manifest>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|manifest| {
                let cost = manifest.metric(METRIC_COST_RATE).unwrap_or(f64::INFINITY);
                let latency = manifest.metric(METRIC_LATENCY_MS).unwrap_or(f64::INFINITY);
                let success = manifest.metric(METRIC_SUCCESS_RATE).unwrap_or(0.0);
                max_cost.is_none_or(|bound| cost <= bound)
                    && max_latency.is_none_or(|bound| latency <= bound)
                    && min_success.is_none_or(|bound| success >= bound)
            })
            .collect())
    }

    /// Every stored manifest
    pub async fn list_all(&self) -> Result<Vec<Manifest>> {
        self.load_all().await
    }

    async fn load_all(&self) -> Result<Vec<Manifest>> {
        let keys = self.storage.list_keys(KEY_PREFIX).await?;
        let mut manifests = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw_id) = key.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            let Ok(agent_id) = AgentId::try_new(raw_id.to_string()) else {
                continue;
            };
            if let Some(manifest) = self.get(&agent_id).await? {
                manifests.push(manifest);
            }
        }
        Ok(manifests)
    }

    async fn persist(&self, manifest: &Manifest) -> Result<()> {
        let document = serde_json::to_value(manifest).map_err(|err| CoordinationError::Fatal {
            reason: format!("manifest serialization failed: {err}"),
        })?;
        self.storage
            .set(&Self::key(&manifest.agent_id), document)
            .await?;
        self.cache
            .insert(manifest.agent_id.clone(), manifest.clone());
        self.event_bus.emit(
            Event::new(
                EventKind::ManifestUpdated,
                event_payload! {
                    "agent_id" => manifest.agent_id.to_string(),
                    "version" => manifest.version,
                },
            )
            .with_source("manifest"),
        );
        Ok(())
    }
}

fn validate_metrics(metrics: &BTreeMap<String, f64>) -> Result<()> {
    for (key, value) in metrics {
        if !value.is_finite() || *value < 0.0 {
            return Err(CoordinationError::InvalidParams {
                reason: format!("metric {key} must be a finite non-negative number"),
            });
        }
        if key == METRIC_SUCCESS_RATE && *value > 1.0 {
            return Err(CoordinationError::InvalidParams {
                reason: "success_rate must be within [0, 1]".into(),
            });
        }
    }
    Ok(())
}
