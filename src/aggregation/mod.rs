//! # Demand Aggregation
//!
//! Accumulates per-product demand until a quantity threshold is crossed, then emits one
//! consolidated `order.generated` event through an [`OrderPublisher`].

pub mod engine;
pub mod store;
pub mod types;

pub use engine::{AggregationEngine, OrderPublisher};
pub use store::{DemandStore, InMemoryDemandStore, PgDemandStore};
pub use types::{
    AggregateOrder, AggregationStats, DemandRecord, NewDemand, PromotionStatus, SubmitOutcome,
};
