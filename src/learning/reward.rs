//! Reward calculation
//!
//! Turns an observed outcome (success, response time, cost) into a scalar
//! reward, falling back to the agent's manifest metrics when an observation
//! is missing and granting a small bonus to agents with a strong manifest
//! success rate.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::domain_types::AgentId;
use crate::manifest::{METRIC_COST_RATE, METRIC_LATENCY_MS, METRIC_SUCCESS_RATE, ManifestService};

/// Normalization ceiling for latency penalties
const LATENCY_SCALE_MS: f64 = 10_000.0;
/// Manifest latency assumed when the manifest carries no latency metric
const DEFAULT_MANIFEST_LATENCY_MS: f64 = 1000.0;

/// Weights applied by [`RewardCalculator`]
#[derive(Debug, Clone, Copy)]
pub struct RewardWeights {
    /// Magnitude of the success/failure term
    pub base_reward: f64,
    /// Weight of the cost penalty
    pub cost_penalty: f64,
    /// Weight of the latency penalty
    pub latency_penalty: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            base_reward: 1.0,
            cost_penalty: 0.2,
            latency_penalty: 0.1,
        }
    }
}

/// Manifest-aware reward calculator
pub struct RewardCalculator {
    manifests: Arc<ManifestService>,
    weights: RewardWeights,
}

impl RewardCalculator {
    /// Creates a calculator with default weights
    #[must_use]
    pub fn new(manifests: Arc<ManifestService>) -> Self {
        Self {
            manifests,
            weights: RewardWeights::default(),
        }
    }

    /// Overrides the weights
    #[must_use]
    pub fn with_weights(mut self, weights: RewardWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Computes the reward for one observed outcome
    ///
    /// `base·(success ? 1 : −1)` minus a cost penalty and a latency penalty,
    /// plus `(manifest_success_rate − 0.5)·0.1` when the action succeeded
    /// and a manifest exists. Missing observations fall back to the
    /// manifest's expected metrics, then to zero.
    pub async fn calculate(
        &self,
        agent_id: &AgentId,
        success: bool,
        response_time_ms: Option<f64>,
        cost: Option<f64>,
    ) -> f64 {
        let mut reward = if success {
            self.weights.base_reward
        } else {
            -self.weights.base_reward
        };

        let metrics = self
            .manifests
            .get(agent_id)
            .await
            .ok()
            .flatten()
            .map(|manifest| {
                (
                    manifest.metric(METRIC_COST_RATE).unwrap_or(0.0),
                    manifest
                        .metric(METRIC_LATENCY_MS)
                        .unwrap_or(DEFAULT_MANIFEST_LATENCY_MS),
                    manifest.metric(METRIC_SUCCESS_RATE).unwrap_or(0.5),
                )
            });

        let cost_component = cost.or(metrics.map(|(cost, _, _)| cost));
        if let Some(cost) = cost_component {
            reward -= cost * self.weights.cost_penalty;
        }

        let latency_component = response_time_ms.or(metrics.map(|(_, latency, _)| latency));
        if let Some(latency) = latency_component {
            reward -= (latency / LATENCY_SCALE_MS).min(1.0) * self.weights.latency_penalty;
        }

        if success {
            if let Some((_, _, success_rate)) = metrics {
                reward += (success_rate - 0.5) * 0.1;
            }
        }

        debug!(
            agent_id = %agent_id,
            reward,
            success,
            ?cost,
            ?response_time_ms,
            "calculated reward",
        );
        reward
    }

    /// Computes a reward from a metrics document
    ///
    /// Recognized keys: `success` (bool), `response_time_ms` (number),
    /// `cost` (number).
    pub async fn composite(&self, agent_id: &AgentId, metrics: &Value) -> f64 {
        let success = metrics
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let response_time_ms = metrics.get("response_time_ms").and_then(Value::as_f64);
        let cost = metrics.get("cost").and_then(Value::as_f64);
        self.calculate(agent_id, success, response_time_ms, cost)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::domain_types::{CapabilityName, RoleName};
    use crate::events::EventBus;
    use crate::manifest::ManifestData;
    use crate::storage::MemoryStorage;
    use approx::assert_relative_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn calculator() -> RewardCalculator {
        RewardCalculator::new(Arc::new(ManifestService::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(EventBus::new()),
        )))
    }

    async fn calculator_with_manifest(cost: f64, latency: f64, success: f64) -> RewardCalculator {
        let manifests = Arc::new(ManifestService::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(EventBus::new()),
        ));
        let agent = Agent::new(
            AgentId::try_new("u1".to_string()).unwrap(),
            "u1",
            RoleName::try_new("general".to_string()).unwrap(),
        )
        .with_capabilities(vec![CapabilityName::try_new("work".to_string()).unwrap()]);
        manifests
            .create_or_replace(
                &agent,
                ManifestData {
                    metrics: BTreeMap::from([
                        (METRIC_COST_RATE.to_string(), cost),
                        (METRIC_LATENCY_MS.to_string(), latency),
                        (METRIC_SUCCESS_RATE.to_string(), success),
                    ]),
                    ..ManifestData::default()
                },
            )
            .await
            .unwrap();
        RewardCalculator::new(manifests)
    }

    #[tokio::test]
    async fn success_without_observations_or_manifest_is_the_base_reward() {
        let calculator = calculator();
        let reward = calculator
            .calculate(&AgentId::try_new("u1".to_string()).unwrap(), true, None, None)
            .await;
        assert_relative_eq!(reward, 1.0);

        let penalty = calculator
            .calculate(&AgentId::try_new("u1".to_string()).unwrap(), false, None, None)
            .await;
        assert_relative_eq!(penalty, -1.0);
    }

    #[tokio::test]
    async fn observed_cost_and_latency_are_penalized() {
        let calculator = calculator();
        // 1.0 - 0.5*0.2 - min(2000/10000, 1)*0.1 = 1.0 - 0.1 - 0.02
        let reward = calculator
            .calculate(
                &AgentId::try_new("u1".to_string()).unwrap(),
                true,
                Some(2000.0),
                Some(0.5),
            )
            .await;
        assert_relative_eq!(reward, 0.88, epsilon = 1e-12);
    }

    #[tokio::test]
    async fn manifest_metrics_fill_in_missing_observations() {
        let calculator = calculator_with_manifest(0.4, 5000.0, 0.9).await;
        // 1.0 - 0.4*0.2 - 0.5*0.1 + (0.9-0.5)*0.1 = 1.0 - 0.08 - 0.05 + 0.04
        let reward = calculator
            .calculate(&AgentId::try_new("u1".to_string()).unwrap(), true, None, None)
            .await;
        assert_relative_eq!(reward, 0.91, epsilon = 1e-12);
    }

    #[tokio::test]
    async fn success_bonus_only_applies_on_success() {
        let calculator = calculator_with_manifest(0.0, 0.0, 0.9).await;
        let failure = calculator
            .calculate(&AgentId::try_new("u1".to_string()).unwrap(), false, Some(0.0), Some(0.0))
            .await;
        assert_relative_eq!(failure, -1.0);
    }

    #[tokio::test]
    async fn composite_reads_the_metrics_document() {
        let calculator = calculator();
        let reward = calculator
            .composite(
                &AgentId::try_new("u1".to_string()).unwrap(),
                &json!({"success": true, "response_time_ms": 2000.0, "cost": 0.5}),
            )
            .await;
        assert_relative_eq!(reward, 0.88, epsilon = 1e-12);
    }
}
