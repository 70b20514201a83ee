//! # Messaging Module
//!
//! Topic-routed AMQP messaging: topology management, a producer with a management-API
//! publish path and a direct fallback, and consumers with acknowledgement-based delivery
//! and automatic reconnection.
//!
//! ## Layers
//!
//! - [`transport`]: `BrokerConnector` / `BrokerChannel` traits, implemented by
//!   [`providers::RabbitMqConnector`] and [`providers::InMemoryBroker`]
//! - [`connection`]: single owned channel with generation-tracked reconnects
//! - [`topology`]: idempotent declared-topology registry
//! - [`broker`]: topology + connection, the management core
//! - [`producer`] / [`consumer`]: publishing and receive loops

pub mod broker;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod management_client;
pub mod producer;
pub mod providers;
pub mod topology;
pub mod transport;
pub mod types;

pub use broker::{Broker, BrokerHealth};
pub use connection::{ChannelLease, ConnectionManager};
pub use consumer::{
    handler_fn, AckMode, ConsumedMessage, Consumer, ConsumerStats, MessageHandler, ProcessOutcome,
};
pub use envelope::MessageEnvelope;
pub use management_client::ManagementClient;
pub use producer::{
    BatchFailure, BatchPublishOutcome, DirectStrategy, ManagementApiStrategy, Producer,
    ProducerStats, PublishStrategy,
};
pub use topology::{DeclareOutcome, TopologySnapshot, TopologyStore};
pub use transport::{BrokerChannel, BrokerConnector, DeliveryStream};
pub use types::{
    BindingSpec, Delivery, ExchangeKind, ExchangeSpec, MessageId, PublishProperties, QueueSpec,
};
