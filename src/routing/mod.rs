//! Routing subsystem
//!
//! Two layers: [`cost_aware`] selects a target agent for a capability from
//! manifest metrics, and [`router`] owns the full resolution chain (direct
//! address, capability lookup, broadcast) plus the delivery seam.

pub mod cost_aware;
pub mod router;

pub use cost_aware::{CostAwareRouter, RoutingStrategy, best_value_score};
pub use router::{
    ChannelDelivery, DeliveryChannel, MessageRouter, REQUIRED_CAPABILITY_KEY, RouteOutcome,
};
