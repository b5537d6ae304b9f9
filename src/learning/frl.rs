//! Federated Q-table aggregation
//!
//! Buffers Q-table snapshots from peer instances and averages them without
//! ever sharing raw interactions. Heterogeneous shapes are reconciled by
//! growing every participant to the element-wise maximum of each dimension
//! with zero padding, which loses no information. Aggregation and
//! privatization are pure functions over matrices; the only side effect is
//! the buffer reset on a successful aggregation.

use dashmap::DashMap;
use rand::Rng;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::domain_types::{AgentId, InstanceId, Timestamp};

/// Minimum number of buffered submissions before averaging
const MIN_SUBMISSIONS: usize = 2;

/// One buffered Q-table submission
#[derive(Debug, Clone)]
pub struct QTableUpdate {
    /// Content-addressed identifier of this submission
    pub update_id: String,
    /// Agent the table belongs to
    pub agent_id: AgentId,
    /// Instance that produced the table
    pub instance_id: InstanceId,
    /// Deep copy of the submitted matrix
    pub matrix: Vec<Vec<f64>>,
    /// Submission metadata
    pub metadata: serde_json::Map<String, Value>,
    /// When the submission arrived
    pub submitted_at: Timestamp,
}

/// Buffer of per-agent Q-table submissions
pub struct FrlAggregator {
    buffer: DashMap<AgentId, Vec<QTableUpdate>>,
    last_aggregation: DashMap<AgentId, Instant>,
    min_interval: Duration,
}

impl FrlAggregator {
    /// Creates an aggregator enforcing `min_interval_seconds` between
    /// aggregations per agent
    #[must_use]
    pub fn new(min_interval_seconds: u64) -> Self {
        Self {
            buffer: DashMap::new(),
            last_aggregation: DashMap::new(),
            min_interval: Duration::from_secs(min_interval_seconds),
        }
    }

    /// Buffers a Q-table snapshot, returning its content-addressed id
    pub fn submit(
        &self,
        agent_id: &AgentId,
        matrix: &[Vec<f64>],
        instance_id: &InstanceId,
        metadata: Option<serde_json::Map<String, Value>>,
    ) -> String {
        let submitted_at = Timestamp::now();
        let update_id = content_id(agent_id, instance_id, matrix, submitted_at);
        let update = QTableUpdate {
            update_id: update_id.clone(),
            agent_id: agent_id.clone(),
            instance_id: instance_id.clone(),
            matrix: matrix.to_vec(),
            metadata: metadata.unwrap_or_default(),
            submitted_at,
        };
        self.buffer.entry(agent_id.clone()).or_default().push(update);
        debug!(agent_id = %agent_id, update_id, "buffered federated update");
        update_id
    }

    /// Averages the buffered submissions for `agent_id`
    ///
    /// Returns `None` when fewer than two submissions are buffered or the
    /// per-agent aggregation interval has not elapsed. On success the
    /// buffer is cleared atomically with the read.
    #[must_use]
    pub fn aggregate(&self, agent_id: &AgentId) -> Option<Vec<Vec<f64>>> {
        if let Some(last) = self.last_aggregation.get(agent_id) {
            if last.elapsed() < self.min_interval {
                debug!(agent_id = %agent_id, "aggregation interval not yet elapsed");
                return None;
            }
        }

        let mut entry = self.buffer.get_mut(agent_id)?;
        if entry.len() < MIN_SUBMISSIONS {
            debug!(agent_id = %agent_id, buffered = entry.len(), "not enough updates");
            return None;
        }
        let updates = std::mem::take(entry.value_mut());
        drop(entry);

        let matrices: Vec<&Vec<Vec<f64>>> = updates.iter().map(|update| &update.matrix).collect();
        let averaged = average(&matrices);
        self.last_aggregation.insert(agent_id.clone(), Instant::now());
        info!(agent_id = %agent_id, participants = updates.len(), "aggregated federated updates");
        Some(averaged)
    }

    /// Census of pending submissions for `agent_id`
    #[must_use]
    pub fn pending_stats(&self, agent_id: &AgentId) -> Value {
        let updates = self.buffer.get(agent_id);
        let updates = updates.as_deref().map(Vec::as_slice).unwrap_or(&[]);
        let mut instances: Vec<String> = updates
            .iter()
            .map(|update| update.instance_id.to_string())
            .collect();
        instances.sort();
        instances.dedup();
        json!({
            "agent_id": agent_id.to_string(),
            "pending_updates": updates.len(),
            "instances": instances,
            "oldest_update": updates.first().map(|u| u.submitted_at),
            "newest_update": updates.last().map(|u| u.submitted_at),
        })
    }

    /// Drops buffered submissions for one agent, or for all agents
    pub fn clear(&self, agent_id: Option<&AgentId>) {
        match agent_id {
            Some(agent_id) => {
                self.buffer.remove(agent_id);
            }
            None => self.buffer.clear(),
        }
    }
}

/// Element-wise mean over matrices grown to the maximum shape
///
/// Every input is zero-padded to `(max rows, max cols)` before averaging,
/// so a cell absent from some participants averages in their implicit
/// zeros.
#[must_use]
pub fn average(matrices: &[&Vec<Vec<f64>>]) -> Vec<Vec<f64>> {
    let rows = matrices.iter().map(|m| m.len()).max().unwrap_or(0);
    let cols = matrices
        .iter()
        .flat_map(|m| m.iter().map(Vec::len))
        .max()
        .unwrap_or(0);
    let count = matrices.len() as f64;

    let mut result = vec![vec![0.0; cols]; rows];
    for matrix in matrices {
        for (row_index, row) in matrix.iter().enumerate() {
            for (col_index, value) in row.iter().enumerate() {
                result[row_index][col_index] += value / count;
            }
        }
    }
    result
}

/// Adds Laplace noise with scale `sensitivity / epsilon` to every cell
///
/// Pure: the input matrix is not modified.
#[must_use]
pub fn privatize(matrix: &[Vec<f64>], epsilon: f64, sensitivity: f64) -> Vec<Vec<f64>> {
    let scale = sensitivity / epsilon;
    let mut rng = rand::thread_rng();
    matrix
        .iter()
        .map(|row| {
            row.iter()
                .map(|value| value + laplace(&mut rng, scale))
                .collect()
        })
        .collect()
}

// Inverse-CDF sampling: u ~ U(-1/2, 1/2), x = -b·sgn(u)·ln(1 - 2|u|).
fn laplace(rng: &mut impl Rng, scale: f64) -> f64 {
    let u: f64 = rng.gen_range(-0.5..0.5);
    -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln()
}

fn content_id(
    agent_id: &AgentId,
    instance_id: &InstanceId,
    matrix: &[Vec<f64>],
    submitted_at: Timestamp,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent_id.as_ref().as_bytes());
    hasher.update(instance_id.as_ref().as_bytes());
    for row in matrix {
        for value in row {
            hasher.update(value.to_le_bytes());
        }
        hasher.update([0xFF]);
    }
    hasher.update(
        serde_json::to_vec(&submitted_at).unwrap_or_default(),
    );
    let digest = hasher.finalize();
    let mut id = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn agent() -> AgentId {
        AgentId::try_new("u1".to_string()).unwrap()
    }

    fn instance(name: &str) -> InstanceId {
        InstanceId::try_new(name.to_string()).unwrap()
    }

    #[test]
    fn aggregation_needs_two_submissions() {
        let aggregator = FrlAggregator::new(0);
        assert!(aggregator.aggregate(&agent()).is_none());

        aggregator.submit(&agent(), &[vec![1.0]], &instance("a"), None);
        assert!(aggregator.aggregate(&agent()).is_none());

        aggregator.submit(&agent(), &[vec![3.0]], &instance("b"), None);
        let averaged = aggregator.aggregate(&agent()).unwrap();
        assert_relative_eq!(averaged[0][0], 2.0);

        // Buffer cleared by the successful aggregation.
        assert!(aggregator.aggregate(&agent()).is_none());
    }

    #[test]
    fn heterogeneous_shapes_grow_to_the_maximum() {
        let aggregator = FrlAggregator::new(0);
        aggregator.submit(&agent(), &[vec![2.0, 4.0]], &instance("a"), None);
        aggregator.submit(
            &agent(),
            &[vec![4.0], vec![6.0]],
            &instance("b"),
            None,
        );

        let averaged = aggregator.aggregate(&agent()).unwrap();
        assert_eq!(averaged.len(), 2);
        assert_eq!(averaged[0].len(), 2);
        assert_relative_eq!(averaged[0][0], 3.0);
        assert_relative_eq!(averaged[0][1], 2.0); // 4.0 padded against 0.0
        assert_relative_eq!(averaged[1][0], 3.0); // 6.0 padded against 0.0
    }

    #[test]
    fn averaging_is_commutative() {
        let first = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let second = vec![vec![5.0], vec![7.0, 8.0]];
        let forward = average(&[&first, &second]);
        let backward = average(&[&second, &first]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn aggregation_interval_is_enforced() {
        let aggregator = FrlAggregator::new(3600);
        aggregator.submit(&agent(), &[vec![1.0]], &instance("a"), None);
        aggregator.submit(&agent(), &[vec![3.0]], &instance("b"), None);
        assert!(aggregator.aggregate(&agent()).is_some());

        aggregator.submit(&agent(), &[vec![1.0]], &instance("a"), None);
        aggregator.submit(&agent(), &[vec![3.0]], &instance("b"), None);
        assert!(aggregator.aggregate(&agent()).is_none());
    }

    #[test]
    fn submissions_are_deep_copies_with_distinct_ids() {
        let aggregator = FrlAggregator::new(0);
        let mut matrix = vec![vec![1.0]];
        let first = aggregator.submit(&agent(), &matrix, &instance("a"), None);
        matrix[0][0] = 99.0;
        let second = aggregator.submit(&agent(), &matrix, &instance("a"), None);
        assert_ne!(first, second);

        let stats = aggregator.pending_stats(&agent());
        assert_eq!(stats["pending_updates"], 2);
        assert_eq!(stats["instances"], json!(["a"]));
    }

    #[test]
    fn privatization_perturbs_without_mutating_the_input() {
        let matrix = vec![vec![0.0; 64]; 4];
        let noisy = privatize(&matrix, 1.0, 1.0);
        assert_eq!(matrix, vec![vec![0.0; 64]; 4]);
        let perturbed = noisy
            .iter()
            .flatten()
            .filter(|value| **value != 0.0)
            .count();
        assert!(perturbed > 0);
        assert!(noisy.iter().flatten().all(|value| value.is_finite()));
    }

    #[test]
    fn tighter_privacy_budgets_add_more_noise_on_average() {
        let matrix = vec![vec![0.0; 512]];
        let tight: f64 = privatize(&matrix, 0.1, 1.0)
            .iter()
            .flatten()
            .map(|v| v.abs())
            .sum();
        let loose: f64 = privatize(&matrix, 10.0, 1.0)
            .iter()
            .flatten()
            .map(|v| v.abs())
            .sum();
        assert!(tight > loose);
    }
}
