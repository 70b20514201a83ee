#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, PostgreSQL in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Demand Broker
//!
//! Topic-routed AMQP messaging with a threshold-triggered demand aggregation flow.
//!
//! ## Overview
//!
//! A producer publishes JSON events, a broker management core keeps routing topology
//! (exchanges, queues, bindings) consistent and idempotent, and consumers process events
//! with acknowledgement-based, at-least-once delivery that survives broker disconnects.
//! On top of the messaging layer, per-product demand is accumulated until a quantity
//! threshold is crossed, which emits one consolidated `order.generated` event; a
//! downstream fulfillment worker turns that into a `stock.reserved` event.
//!
//! ## Module Organization
//!
//! - [`messaging`] - Topology, connection management, producer, consumer, transports
//! - [`web`] - Management HTTP API (axum)
//! - [`aggregation`] - Per-product threshold aggregation engine
//! - [`fulfillment`] - Stock reservation consumer
//! - [`database`] - Postgres pool and migrations
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured tracing setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use demand_broker::messaging::providers::InMemoryBroker;
//! use demand_broker::messaging::{Broker, Producer};
//!
//! # async fn example() -> demand_broker::BrokerResult<()> {
//! let broker = Arc::new(Broker::new(Arc::new(InMemoryBroker::new()), Duration::from_secs(1)));
//! broker.bootstrap_default_topology().await?;
//!
//! let producer = Producer::new("example", broker, None, false);
//! let id = producer
//!     .publish(serde_json::json!({"product_id": "P1"}), "default", "demo.created", false)
//!     .await?;
//! println!("published {id}");
//! # Ok(())
//! # }
//! ```

pub mod aggregation;
pub mod config;
pub mod database;
pub mod error;
pub mod fulfillment;
pub mod logging;
pub mod messaging;
pub mod types;
pub mod web;

pub use aggregation::{AggregationEngine, DemandStore, NewDemand, PromotionStatus, SubmitOutcome};
pub use config::{AppConfig, ConfigManager};
pub use error::{BrokerError, BrokerResult};
pub use messaging::{Broker, Consumer, MessageEnvelope, MessageId, Producer};
