//! Learning subsystem
//!
//! [`q_table`] holds the per-agent value matrices, [`reward`] shapes
//! observed outcomes into scalars, [`engine`] runs the Q-learning loop,
//! and [`frl`] averages tables across peer instances.

pub mod engine;
pub mod frl;
pub mod q_table;
pub mod reward;

pub use engine::{QLearningParams, RlEngine};
pub use frl::{FrlAggregator, QTableUpdate, average, privatize};
pub use q_table::{QTable, QTableStats};
pub use reward::{RewardCalculator, RewardWeights};
