//! Reinforcement-learning engine
//!
//! Per-agent tabular Q-learning with cost- and latency-shaped rewards.
//! Every update emits `rl.reward`, and when federation is enabled the
//! freshly-updated table is snapshotted into the aggregator tagged with
//! this instance's identifier.

use dashmap::DashMap;
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain_types::{AgentId, InstanceId};
use crate::event_payload;
use crate::events::{Event, EventBus, EventKind};
use crate::learning::frl::FrlAggregator;
use crate::learning::q_table::QTable;
use crate::learning::reward::RewardCalculator;
use crate::manifest::ManifestService;

/// Normalization ceiling for the latency shaping term
const LATENCY_SCALE_MS: f64 = 10_000.0;

/// Q-learning hyper-parameters
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QLearningParams {
    /// Learning rate (α)
    pub learning_rate: f64,
    /// Discount factor (γ)
    pub discount_factor: f64,
    /// Exploration rate (ε)
    pub exploration_rate: f64,
    /// Weight of the raw reward in shaping
    pub reward_weight: f64,
    /// Weight of the cost penalty in shaping
    pub cost_weight: f64,
    /// Weight of the latency penalty in shaping
    pub latency_weight: f64,
}

impl Default for QLearningParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            discount_factor: 0.9,
            exploration_rate: 0.1,
            reward_weight: 0.5,
            cost_weight: 0.3,
            latency_weight: 0.2,
        }
    }
}

/// Per-agent Q-learning coordinator
pub struct RlEngine {
    params: QLearningParams,
    tables: DashMap<AgentId, QTable>,
    reward_calculator: RewardCalculator,
    event_bus: Arc<EventBus>,
    aggregator: Option<Arc<FrlAggregator>>,
    instance_id: InstanceId,
}

impl RlEngine {
    /// Creates an engine with default hyper-parameters
    ///
    /// `aggregator` enables federation: every update submits the updated
    /// table, and [`RlEngine::apply_frl_update`] folds averages back in.
    #[must_use]
    pub fn new(
        manifests: Arc<ManifestService>,
        event_bus: Arc<EventBus>,
        aggregator: Option<Arc<FrlAggregator>>,
        instance_id: InstanceId,
    ) -> Self {
        Self {
            params: QLearningParams::default(),
            tables: DashMap::new(),
            reward_calculator: RewardCalculator::new(manifests),
            event_bus,
            aggregator,
            instance_id,
        }
    }

    /// Overrides the hyper-parameters
    #[must_use]
    pub fn with_params(mut self, params: QLearningParams) -> Self {
        self.params = params;
        self
    }

    /// The hyper-parameters in effect
    #[must_use]
    pub fn params(&self) -> QLearningParams {
        self.params
    }

    /// Applies one shaped Q-learning update and returns the new Q-value
    ///
    /// ```text
    /// shaped = w_r·reward − w_c·min(cost, 1) − w_l·min(latency/10000, 1)
    /// Q(s,a) ← Q(s,a) + α·(shaped + γ·maxₐ′ Q(s′,a′) − Q(s,a))
    /// ```
    ///
    /// The cost and latency terms only apply when the observation was
    /// provided.
    pub fn update_q(
        &self,
        agent_id: &AgentId,
        state: &str,
        action: &str,
        reward: f64,
        next_state: &str,
        cost: Option<f64>,
        latency: Option<f64>,
    ) -> f64 {
        let shaped = self.shaped_reward(reward, cost, latency);

        let new_q = {
            let mut entry = self.tables.entry(agent_id.clone()).or_default();
            let table = entry.value_mut();
            let state_index = table.state_index(state);
            let action_index = table.action_index(action);
            let next_state_index = table.state_index(next_state);

            let current = table.at(state_index, action_index);
            let max_next = table.max_over_actions(next_state_index);
            let new_q = current
                + self.params.learning_rate
                    * (shaped + self.params.discount_factor * max_next - current);
            table.set(state_index, action_index, new_q);
            new_q
        };

        debug!(
            agent_id = %agent_id,
            state,
            action,
            reward,
            shaped,
            new_q,
            "updated Q-value",
        );
        self.event_bus.emit(
            Event::new(
                EventKind::RlReward,
                event_payload! {
                    "agent_id" => agent_id.to_string(),
                    "reward" => reward,
                    "q_value" => new_q,
                    "state" => state,
                    "action" => action,
                },
            )
            .with_source("rl"),
        );

        if let Some(aggregator) = &self.aggregator {
            let matrix = self
                .tables
                .get(agent_id)
                .map(|table| table.to_matrix())
                .unwrap_or_default();
            aggregator.submit(agent_id, &matrix, &self.instance_id, None);
        }
        new_q
    }

    /// Calculates a reward from an observed outcome, then applies it
    pub async fn calculate_and_update(
        &self,
        agent_id: &AgentId,
        success: bool,
        state: &str,
        action: &str,
        next_state: &str,
        response_time_ms: Option<f64>,
        cost: Option<f64>,
    ) -> f64 {
        let reward = self
            .reward_calculator
            .calculate(agent_id, success, response_time_ms, cost)
            .await;
        self.update_q(
            agent_id,
            state,
            action,
            reward,
            next_state,
            cost,
            response_time_ms,
        )
    }

    /// ε-greedy action selection over the supplied legal actions
    ///
    /// With probability ε a uniform choice; otherwise the action with the
    /// largest current Q-value, ties broken by argument order. An agent
    /// with no table gets the first action.
    #[must_use]
    pub fn select_action(&self, agent_id: &AgentId, state: &str, actions: &[String]) -> Option<String> {
        if actions.is_empty() {
            return None;
        }
        if rand::thread_rng().r#gen::<f64>() < self.params.exploration_rate {
            return actions.choose(&mut rand::thread_rng()).cloned();
        }
        self.best_action(agent_id, state, actions)
    }

    /// Greedy action selection, ties broken by argument order
    #[must_use]
    pub fn best_action(&self, agent_id: &AgentId, state: &str, actions: &[String]) -> Option<String> {
        let first = actions.first()?;
        let Some(table) = self.tables.get(agent_id) else {
            return Some(first.clone());
        };

        let mut best = first;
        let mut best_q = QTable::value(&table, state, first);
        for action in &actions[1..] {
            let q = QTable::value(&table, state, action);
            if q > best_q {
                best = action;
                best_q = q;
            }
        }
        Some(best.clone())
    }

    /// Current Q-value for a `(state, action)` pair, zero when unseen
    #[must_use]
    pub fn q_value(&self, agent_id: &AgentId, state: &str, action: &str) -> f64 {
        self.tables
            .get(agent_id)
            .map(|table| QTable::value(&table, state, action))
            .unwrap_or(0.0)
    }

    /// Snapshot of the agent's Q-matrix
    #[must_use]
    pub fn q_matrix(&self, agent_id: &AgentId) -> Option<Vec<Vec<f64>>> {
        self.tables.get(agent_id).map(|table| table.to_matrix())
    }

    /// Folds the federated average for `agent_id` back into its table
    ///
    /// Returns whether an aggregation was available and applied. Emits
    /// `frl.aggregation` and `rl.model_updated`.
    pub fn apply_frl_update(&self, agent_id: &AgentId) -> bool {
        let Some(aggregator) = &self.aggregator else {
            return false;
        };
        let Some(averaged) = aggregator.aggregate(agent_id) else {
            return false;
        };

        let shape = (averaged.len(), averaged.first().map_or(0, Vec::len));
        if let Some(mut entry) = self.tables.get_mut(agent_id) {
            entry.value_mut().load_matrix(&averaged);
        }
        info!(agent_id = %agent_id, ?shape, "applied federated update");

        self.event_bus.emit(
            Event::new(
                EventKind::FrlAggregation,
                event_payload! {
                    "agent_id" => agent_id.to_string(),
                    "rows" => shape.0,
                    "cols" => shape.1,
                },
            )
            .with_source("frl"),
        );
        self.event_bus.emit(
            Event::new(
                EventKind::RlModelUpdated,
                event_payload! {"agent_id" => agent_id.to_string()},
            )
            .with_source("rl"),
        );
        true
    }

    /// Learning statistics for `agent_id`, including the pending federated
    /// census when federation is enabled
    #[must_use]
    pub fn statistics(&self, agent_id: &AgentId) -> Value {
        let q_learning = self.tables.get(agent_id).map(|table| {
            let stats = table.statistics();
            json!({
                "num_states": stats.num_states,
                "num_actions": stats.num_actions,
                "max_q_value": stats.max_q,
                "min_q_value": stats.min_q,
                "mean_q_value": stats.mean_q,
                "params": self.params,
            })
        });

        let mut result = json!({
            "agent_id": agent_id.to_string(),
            "q_learning": q_learning,
        });
        if let Some(aggregator) = &self.aggregator {
            result["frl"] = aggregator.pending_stats(agent_id);
        }
        result
    }

    fn shaped_reward(&self, reward: f64, cost: Option<f64>, latency: Option<f64>) -> f64 {
        let mut shaped = reward * self.params.reward_weight;
        if let Some(cost) = cost {
            shaped -= cost.min(1.0) * self.params.cost_weight;
        }
        if let Some(latency) = latency {
            shaped -= (latency / LATENCY_SCALE_MS).min(1.0) * self.params.latency_weight;
        }
        shaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use approx::assert_relative_eq;

    fn agent() -> AgentId {
        AgentId::try_new("a1".to_string()).unwrap()
    }

    fn engine(aggregator: Option<Arc<FrlAggregator>>) -> RlEngine {
        let manifests = Arc::new(ManifestService::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(EventBus::new()),
        ));
        RlEngine::new(
            manifests,
            Arc::new(EventBus::new()),
            aggregator,
            InstanceId::try_new("test-instance".to_string()).unwrap(),
        )
    }

    #[test]
    fn cost_shaped_update_matches_the_formula() {
        let engine = engine(None);
        // shaped = 0.5·1 − 0.3·0.5 − 0.2·0.2 = 0.31; Q = 0.1·0.31 = 0.031
        let new_q = engine.update_q(&agent(), "s1", "act", 1.0, "s2", Some(0.5), Some(2000.0));
        assert_relative_eq!(new_q, 0.031, epsilon = 1e-9);
        assert_relative_eq!(engine.q_value(&agent(), "s1", "act"), 0.031, epsilon = 1e-9);
    }

    #[test]
    fn unshaped_update_only_weights_the_reward() {
        let engine = engine(None);
        let new_q = engine.update_q(&agent(), "s1", "act", 1.0, "s2", None, None);
        assert_relative_eq!(new_q, 0.05, epsilon = 1e-12);
    }

    #[test]
    fn future_value_is_discounted_from_the_next_state() {
        let engine = engine(None);
        // Seed the next state with a known Q-value.
        engine.update_q(&agent(), "s2", "act", 1.0, "s3", None, None);
        let seeded = engine.q_value(&agent(), "s2", "act");
        assert_relative_eq!(seeded, 0.05, epsilon = 1e-12);

        let new_q = engine.update_q(&agent(), "s1", "act", 1.0, "s2", None, None);
        // 0.1·(0.5 + 0.9·0.05) = 0.0545
        assert_relative_eq!(new_q, 0.0545, epsilon = 1e-12);
    }

    #[test]
    fn cost_and_latency_terms_clamp_at_one() {
        let engine = engine(None);
        let new_q = engine.update_q(&agent(), "s1", "act", 1.0, "s2", Some(50.0), Some(1e9));
        // shaped = 0.5 − 0.3 − 0.2 = 0.0
        assert_relative_eq!(new_q, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn greedy_selection_prefers_the_learned_action_and_argument_order() {
        let engine = engine(None);
        let actions = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        // No table yet: first action.
        assert_eq!(
            engine.best_action(&agent(), "s", &actions).as_deref(),
            Some("a")
        );

        engine.update_q(&agent(), "s", "b", 1.0, "s2", None, None);
        assert_eq!(
            engine.best_action(&agent(), "s", &actions).as_deref(),
            Some("b")
        );

        // All-zero ties resolve to the first argument.
        assert_eq!(
            engine.best_action(&agent(), "fresh", &actions).as_deref(),
            Some("a")
        );
        assert!(engine.select_action(&agent(), "s", &[]).is_none());
    }

    #[test]
    fn selected_actions_are_always_legal() {
        let engine = engine(None);
        let actions = vec!["a".to_string(), "b".to_string()];
        for _ in 0..100 {
            let chosen = engine.select_action(&agent(), "s", &actions).unwrap();
            assert!(actions.contains(&chosen));
        }
    }

    #[test]
    fn updates_feed_the_aggregator_when_federation_is_on() {
        let aggregator = Arc::new(FrlAggregator::new(0));
        let engine = engine(Some(Arc::clone(&aggregator)));

        engine.update_q(&agent(), "s1", "act", 1.0, "s2", None, None);
        engine.update_q(&agent(), "s1", "act", 1.0, "s2", None, None);
        let stats = aggregator.pending_stats(&agent());
        assert_eq!(stats["pending_updates"], 2);

        assert!(engine.apply_frl_update(&agent()));
        assert!(!engine.apply_frl_update(&agent()));
    }

    #[test]
    fn statistics_report_shape_and_hyper_parameters() {
        let engine = engine(None);
        engine.update_q(&agent(), "s1", "a", 1.0, "s2", None, None);
        engine.update_q(&agent(), "s1", "b", -1.0, "s2", None, None);

        let stats = engine.statistics(&agent());
        assert_eq!(stats["q_learning"]["num_states"], 2);
        assert_eq!(stats["q_learning"]["num_actions"], 2);
        assert_relative_eq!(
            stats["q_learning"]["params"]["learning_rate"].as_f64().unwrap(),
            0.1
        );
        assert!(stats["frl"].is_null());
    }
}
