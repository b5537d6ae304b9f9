//! Cost-aware agent selection
//!
//! Selects a target agent for a capability from manifest metrics under one
//! of four strategies. Selection is fully deterministic: every strategy has
//! a fixed tie-break chain ending in lexicographic agent id, so two
//! instances with identical manifests always pick the same agent.

use std::cmp::Ordering;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::domain_types::{AgentId, CapabilityName};
use crate::error::Result;
use crate::manifest::{
    METRIC_COST_RATE, METRIC_LATENCY_MS, METRIC_SUCCESS_RATE, Manifest, ManifestService,
};

/// Normalization ceiling for latency in the best-value score
const LATENCY_SCALE_MS: f64 = 10_000.0;

/// Strategy used to pick among capable agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Minimize `cost_rate`
    LowestCost,
    /// Minimize `latency_ms`
    LowestLatency,
    /// Maximize `success_rate`
    HighestSuccess,
    /// Maximize the balanced score of success, cost, and latency
    BestValue,
}

impl Default for RoutingStrategy {
    fn default() -> Self {
        Self::BestValue
    }
}

/// The balanced score used by [`RoutingStrategy::BestValue`]
///
/// `0.5·success − 0.25·min(cost, 1) − 0.25·min(latency / 10000, 1)`, with
/// absent metrics read as cost 1.0, latency 1000 ms, success 0.5.
#[must_use]
pub fn best_value_score(manifest: &Manifest) -> f64 {
    let cost = manifest.metric(METRIC_COST_RATE).unwrap_or(1.0);
    let latency = manifest.metric(METRIC_LATENCY_MS).unwrap_or(1000.0);
    let success = manifest.metric(METRIC_SUCCESS_RATE).unwrap_or(0.5);
    0.5 * success - 0.25 * cost.min(1.0) - 0.25 * (latency / LATENCY_SCALE_MS).min(1.0)
}

/// Cost-aware agent selector
pub struct CostAwareRouter {
    manifests: Arc<ManifestService>,
    strategy: RwLock<RoutingStrategy>,
}

impl CostAwareRouter {
    /// Creates a selector with the default (`best_value`) strategy
    #[must_use]
    pub fn new(manifests: Arc<ManifestService>) -> Self {
        Self {
            manifests,
            strategy: RwLock::new(RoutingStrategy::default()),
        }
    }

    /// Replaces the instance strategy
    pub fn set_strategy(&self, strategy: RoutingStrategy) {
        *self.strategy.write().expect("strategy lock poisoned") = strategy;
        debug!(?strategy, "routing strategy set");
    }

    /// The current instance strategy
    #[must_use]
    pub fn strategy(&self) -> RoutingStrategy {
        *self.strategy.read().expect("strategy lock poisoned")
    }

    /// Selects the best agent for `capability`
    ///
    /// Candidates are first filtered by the hard constraints; an empty
    /// filtered set yields `None` rather than an error. Agents without
    /// manifests never appear, because selection is manifest-driven.
    pub async fn select(
        &self,
        capability: &CapabilityName,
        strategy: Option<RoutingStrategy>,
        max_cost: Option<f64>,
        max_latency: Option<f64>,
    ) -> Result<Option<AgentId>> {
        let strategy = strategy.unwrap_or_else(|| self.strategy());
        let mut candidates = self.candidates(capability, max_cost, max_latency).await?;
        if candidates.is_empty() {
            warn!(capability = %capability, "no candidates for capability");
            return Ok(None);
        }

        candidates.sort_by(|a, b| compare(strategy, a, b));
        let selected = candidates.remove(0);
        debug!(
            capability = %capability,
            agent_id = %selected.agent_id,
            ?strategy,
            "selected agent",
        );
        Ok(Some(selected.agent_id))
    }

    /// Ranks capable agents under the instance strategy, best first
    pub async fn rank(&self, capability: &CapabilityName, limit: usize) -> Result<Vec<Manifest>> {
        let strategy = self.strategy();
        let mut candidates = self.candidates(capability, None, None).await?;
        candidates.sort_by(|a, b| compare(strategy, a, b));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn candidates(
        &self,
        capability: &CapabilityName,
        max_cost: Option<f64>,
        max_latency: Option<f64>,
    ) -> Result<Vec<Manifest>> {
        let manifests = self.manifests.find_by_capability(capability).await?;
        Ok(manifests
            .into_iter()
            .filter(|manifest| {
                let cost = manifest.metric(METRIC_COST_RATE).unwrap_or(f64::INFINITY);
                let latency = manifest.metric(METRIC_LATENCY_MS).unwrap_or(f64::INFINITY);
                max_cost.is_none_or(|bound| cost <= bound)
                    && max_latency.is_none_or(|bound| latency <= bound)
            })
            .collect())
    }
}

fn compare(strategy: RoutingStrategy, a: &Manifest, b: &Manifest) -> Ordering {
    let cost = |m: &Manifest| m.metric(METRIC_COST_RATE).unwrap_or(f64::INFINITY);
    let latency = |m: &Manifest| m.metric(METRIC_LATENCY_MS).unwrap_or(f64::INFINITY);
    let success = |m: &Manifest| m.metric(METRIC_SUCCESS_RATE).unwrap_or(0.0);

    match strategy {
        RoutingStrategy::LowestCost => cost(a)
            .total_cmp(&cost(b))
            .then_with(|| latency(a).total_cmp(&latency(b)))
            .then_with(|| success(b).total_cmp(&success(a)))
            .then_with(|| a.agent_id.cmp(&b.agent_id)),
        RoutingStrategy::LowestLatency => latency(a)
            .total_cmp(&latency(b))
            .then_with(|| cost(a).total_cmp(&cost(b)))
            .then_with(|| success(b).total_cmp(&success(a)))
            .then_with(|| a.agent_id.cmp(&b.agent_id)),
        RoutingStrategy::HighestSuccess => success(b)
            .total_cmp(&success(a))
            .then_with(|| cost(a).total_cmp(&cost(b)))
            .then_with(|| latency(a).total_cmp(&latency(b)))
            .then_with(|| a.agent_id.cmp(&b.agent_id)),
        RoutingStrategy::BestValue => best_value_score(b)
            .total_cmp(&best_value_score(a))
            .then_with(|| a.agent_id.cmp(&b.agent_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::domain_types::RoleName;
    use crate::events::EventBus;
    use crate::manifest::ManifestData;
    use crate::storage::MemoryStorage;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn capability() -> CapabilityName {
        CapabilityName::try_new("work".to_string()).unwrap()
    }

    async fn seeded(entries: &[(&str, f64, f64, f64)]) -> (Arc<ManifestService>, CostAwareRouter) {
        let manifests = Arc::new(ManifestService::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(EventBus::new()),
        ));
        for (id, cost, latency, success) in entries {
            let agent = Agent::new(
                AgentId::try_new((*id).to_string()).unwrap(),
                *id,
                RoleName::try_new("general".to_string()).unwrap(),
            )
            .with_capabilities(vec![capability()]);
            manifests
                .create_or_replace(
                    &agent,
                    ManifestData {
                        metrics: BTreeMap::from([
                            (METRIC_COST_RATE.to_string(), *cost),
                            (METRIC_LATENCY_MS.to_string(), *latency),
                            (METRIC_SUCCESS_RATE.to_string(), *success),
                        ]),
                        ..ManifestData::default()
                    },
                )
                .await
                .unwrap();
        }
        let router = CostAwareRouter::new(Arc::clone(&manifests));
        (manifests, router)
    }

    #[tokio::test]
    async fn best_value_picks_the_highest_score() {
        // m1: 0.45 - 0.05 - 0.0125 = 0.3875; m2: 0.3 - 0.0125 - 0.125 = 0.1625
        let (_, router) = seeded(&[("m1", 0.2, 500.0, 0.9), ("m2", 0.05, 5000.0, 0.6)]).await;

        let selected = router
            .select(&capability(), None, None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selected.to_string(), "m1");
    }

    #[tokio::test]
    async fn best_value_score_matches_the_formula() {
        let (manifests, _) = seeded(&[("m1", 0.2, 500.0, 0.9)]).await;
        let manifest = manifests
            .get(&AgentId::try_new("m1".to_string()).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_relative_eq!(best_value_score(&manifest), 0.3875, epsilon = 1e-12);
    }

    #[tokio::test]
    async fn lowest_cost_breaks_ties_by_latency_then_success_then_id() {
        let (_, router) = seeded(&[
            ("b", 0.1, 200.0, 0.5),
            ("a", 0.1, 200.0, 0.5),
            ("c", 0.1, 100.0, 0.5),
        ])
        .await;

        let selected = router
            .select(&capability(), Some(RoutingStrategy::LowestCost), None, None)
            .await
            .unwrap()
            .unwrap();
        // Equal cost everywhere: "c" wins on latency; "a" would win the id
        // tie among the rest.
        assert_eq!(selected.to_string(), "c");

        let ranked = router.rank(&capability(), 10).await.unwrap();
        let order: Vec<String> = ranked.iter().map(|m| m.agent_id.to_string()).collect();
        router.set_strategy(RoutingStrategy::LowestCost);
        let ranked = router.rank(&capability(), 10).await.unwrap();
        let cost_order: Vec<String> = ranked.iter().map(|m| m.agent_id.to_string()).collect();
        assert_eq!(cost_order, vec!["c", "a", "b"]);
        assert_eq!(order.len(), 3);
    }

    #[tokio::test]
    async fn highest_success_prefers_success_then_cheapness() {
        let (_, router) = seeded(&[("a", 0.5, 100.0, 0.9), ("b", 0.1, 100.0, 0.9)]).await;
        let selected = router
            .select(
                &capability(),
                Some(RoutingStrategy::HighestSuccess),
                None,
                None,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selected.to_string(), "b");
    }

    #[tokio::test]
    async fn hard_constraints_filter_before_selection() {
        let (_, router) = seeded(&[("a", 0.5, 100.0, 0.9), ("b", 0.1, 9000.0, 0.6)]).await;

        let selected = router
            .select(&capability(), None, Some(0.2), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selected.to_string(), "b");

        let none = router
            .select(&capability(), None, Some(0.01), None)
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn unknown_capability_selects_nobody() {
        let (_, router) = seeded(&[("a", 0.5, 100.0, 0.9)]).await;
        let none = router
            .select(
                &CapabilityName::try_new("missing".to_string()).unwrap(),
                None,
                None,
                None,
            )
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn rank_honours_the_limit() {
        let (_, router) = seeded(&[
            ("a", 0.1, 100.0, 0.9),
            ("b", 0.2, 200.0, 0.8),
            ("c", 0.3, 300.0, 0.7),
        ])
        .await;
        let ranked = router.rank(&capability(), 2).await.unwrap();
        assert_eq!(ranked.len(), 2);
    }
}
