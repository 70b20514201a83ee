//! # Broker Transport Traits
//!
//! The seam between the messaging layer and a concrete AMQP implementation. A
//! [`BrokerConnector`] opens channels; a [`BrokerChannel`] carries every protocol
//! operation the producer, consumer and management core need.
//!
//! Both traits are object safe so the connection manager can hold
//! `Arc<dyn BrokerChannel>` regardless of provider.

use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use super::types::{BindingSpec, Delivery, ExchangeSpec, PublishProperties, QueueSpec};
use crate::error::BrokerResult;

/// Stream of deliveries from a `basic.consume`; ends when the channel closes
pub type DeliveryStream = Pin<Box<dyn Stream<Item = BrokerResult<Delivery>> + Send>>;

/// Opens channels against a broker
#[async_trait]
pub trait BrokerConnector: Send + Sync + Debug + 'static {
    /// Open a new connection and return a channel on it
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    /// Provider name for logging
    fn provider_name(&self) -> &'static str;
}

/// One open channel on a broker connection
#[async_trait]
pub trait BrokerChannel: Send + Sync + Debug {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()>;

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()>;

    async fn bind_queue(&self, binding: &BindingSpec) -> BrokerResult<()>;

    /// Publish a message; resolves once the broker has accepted it
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: PublishProperties,
    ) -> BrokerResult<()>;

    /// Start a push-based consumer on `queue`
    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream>;

    /// Fetch a single message if one is ready (`basic.get`)
    async fn get(&self, queue: &str) -> BrokerResult<Option<Delivery>>;

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    fn is_connected(&self) -> bool;

    /// Close the channel and its connection; errors are reported but the channel is
    /// unusable afterwards either way
    async fn close(&self) -> BrokerResult<()>;
}
