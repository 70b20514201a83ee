//! # Broker Transport Providers
//!
//! Concrete implementations of the [`BrokerConnector`](super::transport::BrokerConnector)
//! trait.
//!
//! ## Providers
//!
//! - [`RabbitMqConnector`] - RabbitMQ via the lapin crate
//! - [`InMemoryBroker`] - In-process AMQP model for tests and local development

mod in_memory;
mod rabbitmq;

pub use in_memory::{topic_matches, DeadLetter, DeadLetterReason, InMemoryBroker, InMemoryChannel};
pub use rabbitmq::{RabbitMqChannel, RabbitMqConnector};
