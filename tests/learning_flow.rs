//! Q-learning and federated aggregation flows.

use approx::assert_relative_eq;

use switchboard::config::CoordinatorConfig;
use switchboard::coordinator::Coordinator;
use switchboard::domain_types::{AgentId, InstanceId};
use switchboard::events::EventKind;
use switchboard::learning::{FrlAggregator, average, privatize};

fn agent_id(id: &str) -> AgentId {
    AgentId::try_new(id.to_string()).unwrap()
}

#[tokio::test]
async fn cost_shaped_update_matches_the_worked_example() {
    let coordinator = Coordinator::new(CoordinatorConfig::testing()).await.unwrap();
    let mut events = coordinator.events().subscribe();

    let new_q = coordinator.learning().update_q(
        &agent_id("a1"),
        "s1",
        "act",
        1.0,
        "s2",
        Some(0.5),
        Some(2000.0),
    );

    // shaped = 0.5·1 − 0.3·0.5 − 0.2·0.2 = 0.31, Q = 0 + 0.1·(0.31 + 0 − 0)
    assert_relative_eq!(new_q, 0.031, epsilon = 1e-9);
    assert_relative_eq!(
        coordinator.learning().q_value(&agent_id("a1"), "s1", "act"),
        0.031,
        epsilon = 1e-9
    );

    let reward_event = events.recv().await.unwrap();
    assert_eq!(reward_event.kind, EventKind::RlReward);
    assert_eq!(reward_event.payload["agent_id"], "a1");
}

#[tokio::test]
async fn q_values_stay_finite_across_many_updates() {
    let coordinator = Coordinator::new(CoordinatorConfig::testing()).await.unwrap();
    for round in 0..200 {
        let state = format!("s{}", round % 7);
        let next = format!("s{}", (round + 1) % 7);
        let action = format!("a{}", round % 5);
        let reward = if round % 3 == 0 { 1.0 } else { -1.0 };
        let q = coordinator.learning().update_q(
            &agent_id("a1"),
            &state,
            &action,
            reward,
            &next,
            Some(0.3),
            Some(1500.0),
        );
        assert!(q.is_finite());
    }

    let stats = coordinator.learning().statistics(&agent_id("a1"));
    assert_eq!(stats["q_learning"]["num_states"], 7);
    assert_eq!(stats["q_learning"]["num_actions"], 5);
}

#[tokio::test]
async fn federated_updates_flow_from_engine_to_aggregator_and_back() {
    let coordinator = Coordinator::new(CoordinatorConfig::testing()).await.unwrap();
    let mut events = coordinator.events().subscribe();

    // Two updates buffer two snapshots under the testing config (interval 0).
    coordinator
        .learning()
        .update_q(&agent_id("a1"), "s1", "act", 1.0, "s2", None, None);
    coordinator
        .learning()
        .update_q(&agent_id("a1"), "s1", "act", 1.0, "s2", None, None);

    let frl = coordinator.frl().expect("testing config enables FRL");
    assert_eq!(frl.pending_stats(&agent_id("a1"))["pending_updates"], 2);

    assert!(coordinator.learning().apply_frl_update(&agent_id("a1")));
    assert_eq!(frl.pending_stats(&agent_id("a1"))["pending_updates"], 0);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&EventKind::FrlAggregation));
    assert!(kinds.contains(&EventKind::RlModelUpdated));
}

#[test]
fn aggregation_is_commutative_and_shape_growing() {
    let instance_a = InstanceId::try_new("peer-a".to_string()).unwrap();
    let instance_b = InstanceId::try_new("peer-b".to_string()).unwrap();
    let small = vec![vec![0.2, 0.4]];
    let large = vec![vec![0.6], vec![1.0, 2.0]];

    let forward = {
        let aggregator = FrlAggregator::new(0);
        aggregator.submit(&agent_id("a1"), &small, &instance_a, None);
        aggregator.submit(&agent_id("a1"), &large, &instance_b, None);
        aggregator.aggregate(&agent_id("a1")).unwrap()
    };
    let backward = {
        let aggregator = FrlAggregator::new(0);
        aggregator.submit(&agent_id("a1"), &large, &instance_b, None);
        aggregator.submit(&agent_id("a1"), &small, &instance_a, None);
        aggregator.aggregate(&agent_id("a1")).unwrap()
    };

    assert_eq!(forward, backward);
    assert_eq!(forward.len(), 2);
    assert_eq!(forward[0].len(), 2);
    assert_relative_eq!(forward[0][0], 0.4);
    assert_relative_eq!(forward[0][1], 0.2);
    assert_relative_eq!(forward[1][1], 1.0);
}

#[test]
fn privatized_aggregates_stay_close_for_generous_budgets() {
    let matrix = vec![vec![1.0; 32]; 8];
    let noisy = privatize(&matrix, 1000.0, 1.0);
    for (row, noisy_row) in matrix.iter().zip(&noisy) {
        for (value, noisy_value) in row.iter().zip(noisy_row) {
            assert!((value - noisy_value).abs() < 0.5);
        }
    }
}

#[test]
fn average_of_identical_matrices_is_identity() {
    let matrix = vec![vec![0.25, -0.5], vec![1.5, 0.0]];
    let averaged = average(&[&matrix, &matrix, &matrix]);
    for (row, averaged_row) in matrix.iter().zip(&averaged) {
        for (value, averaged_value) in row.iter().zip(averaged_row) {
            assert_relative_eq!(*value, *averaged_value, epsilon = 1e-12);
        }
    }
}
