//! # Broker Management Core
//!
//! Topology Store plus Connection Manager: the operations behind the management HTTP
//! service, and the shared plumbing the producer and consumer use to declare topology and
//! publish.
//!
//! Declarations go through the store first. Only a newly created record is declared on
//! the broker; if the broker refuses it, the record is rolled back so the store never
//! claims topology the broker does not have. Declarations are serialized so the
//! check-then-declare sequence is atomic per broker instance.
//!
//! Operations that hit a connection error reconnect and retry once on the new channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::connection::ConnectionManager;
use super::envelope::ensure_message_identity;
use super::providers::RabbitMqConnector;
use super::topology::{DeclareOutcome, TopologySnapshot, TopologyStore};
use super::transport::{BrokerChannel, BrokerConnector};
use super::types::{
    BindingSpec, ExchangeKind, ExchangeSpec, MessageId, PublishProperties, QueueSpec,
};
use crate::config::AppConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::logging::{log_publish_operation, log_topology_operation};

/// Name shared by the exchange and queue of the bootstrap topology
pub const DEFAULT_TOPOLOGY_NAME: &str = "default";
/// Routing key binding the default queue to every message on the default exchange
pub const DEFAULT_ROUTING_KEY: &str = "#";

/// Connection and topology summary reported by `/health`
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerHealth {
    pub provider: String,
    pub connected: bool,
    pub generation: u64,
    pub reconnects: u64,
    pub exchanges: usize,
    pub queues: usize,
    pub bindings: usize,
}

/// Topology store and connection manager behind one handle
#[derive(Debug)]
pub struct Broker {
    connection: Arc<ConnectionManager>,
    topology: Arc<TopologyStore>,
    declare_lock: Mutex<()>,
}

impl Broker {
    pub fn new(connector: Arc<dyn BrokerConnector>, reconnect_delay: Duration) -> Self {
        Self::with_parts(
            Arc::new(ConnectionManager::new(connector, reconnect_delay)),
            Arc::new(TopologyStore::new()),
        )
    }

    pub fn with_parts(connection: Arc<ConnectionManager>, topology: Arc<TopologyStore>) -> Self {
        Self {
            connection,
            topology,
            declare_lock: Mutex::new(()),
        }
    }

    /// Broker backed by RabbitMQ as configured
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            Arc::new(RabbitMqConnector::new(config.rabbitmq.clone())),
            config.consumer.reconnect_delay(),
        )
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn topology(&self) -> &Arc<TopologyStore> {
        &self.topology
    }

    /// Run `op` on the current channel, retrying once on a fresh channel after connection loss
    ///
    /// Makes at most two connection attempts, so request paths fail fast while the broker
    /// is down instead of waiting on the unbounded reconnect loop.
    pub async fn with_channel<T, F, Fut>(&self, op: F) -> BrokerResult<T>
    where
        F: Fn(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        let lease = self.connection.acquire().await?;
        match op(Arc::clone(&lease.channel)).await {
            Err(e) if e.is_connection_error() => {
                warn!(
                    generation = lease.generation,
                    error = %e,
                    "Broker operation lost its connection, retrying on a new channel"
                );
                self.connection.invalidate(lease.generation).await;
                let fresh = self.connection.acquire().await?;
                op(fresh.channel).await
            }
            other => other,
        }
    }

    pub async fn create_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerResult<DeclareOutcome> {
        let _guard = self.declare_lock.lock().await;
        let outcome = self.topology.declare_exchange(name, kind, durable)?;
        if outcome.is_created() {
            let spec = ExchangeSpec::new(name, kind, durable);
            let spec = &spec;
            if let Err(e) = self
                .with_channel(move |ch| async move { ch.declare_exchange(spec).await })
                .await
            {
                self.topology.forget_exchange(name);
                log_topology_operation("declare", "exchange", name, "failed");
                return Err(e);
            }
        }
        log_topology_operation("declare", "exchange", name, outcome_label(outcome));
        Ok(outcome)
    }

    pub async fn create_queue(&self, name: &str, durable: bool) -> BrokerResult<DeclareOutcome> {
        let _guard = self.declare_lock.lock().await;
        let outcome = self.topology.declare_queue(name, durable)?;
        if outcome.is_created() {
            let spec = QueueSpec::new(name, durable);
            let spec = &spec;
            if let Err(e) = self
                .with_channel(move |ch| async move { ch.declare_queue(spec).await })
                .await
            {
                self.topology.forget_queue(name);
                log_topology_operation("declare", "queue", name, "failed");
                return Err(e);
            }
        }
        log_topology_operation("declare", "queue", name, outcome_label(outcome));
        Ok(outcome)
    }

    pub async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<DeclareOutcome> {
        let _guard = self.declare_lock.lock().await;
        let outcome = self.topology.bind(queue, exchange, routing_key)?;
        let binding = BindingSpec::new(queue, exchange, routing_key);
        let label = format!("{queue} -> {exchange} ({routing_key})");
        if outcome.is_created() {
            let spec = &binding;
            if let Err(e) = self
                .with_channel(move |ch| async move { ch.bind_queue(spec).await })
                .await
            {
                self.topology.forget_binding(&binding);
                log_topology_operation("declare", "binding", &label, "failed");
                return Err(e);
            }
        }
        log_topology_operation("declare", "binding", &label, outcome_label(outcome));
        Ok(outcome)
    }

    /// Declare `name` as a durable exchange of `kind` unless the store already knows it
    ///
    /// The default exchange (`""`) always exists and is never declared.
    pub async fn ensure_exchange(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()> {
        if name.is_empty() || self.topology.has_exchange(name) {
            return Ok(());
        }
        match self.create_exchange(name, kind, true).await {
            Ok(_) => Ok(()),
            // Declared concurrently with other attributes; publishing still works
            Err(BrokerError::TopologyConflict { message, .. }) => {
                debug!(exchange = %name, reason = %message, "Exchange exists with other attributes");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Declare exchange, durable queue and binding for a consumer subscription
    pub async fn declare_subscription(&self, binding: &BindingSpec) -> BrokerResult<()> {
        self.create_queue(&binding.queue, true).await?;
        if binding.exchange.is_empty() {
            return Ok(());
        }
        self.ensure_exchange(&binding.exchange, ExchangeKind::Topic)
            .await?;
        self.bind(&binding.queue, &binding.exchange, &binding.routing_key)
            .await?;
        Ok(())
    }

    /// Re-declare a subscription on a specific channel, bypassing the store
    ///
    /// Used after a reconnect: the store already holds the records, the new channel has
    /// not seen them.
    pub async fn redeclare_subscription(
        &self,
        channel: &dyn BrokerChannel,
        binding: &BindingSpec,
    ) -> BrokerResult<()> {
        let durable = self
            .topology
            .list_queues()
            .into_iter()
            .find(|q| q.name == binding.queue)
            .map(|q| q.durable)
            .unwrap_or(true);
        channel
            .declare_queue(&QueueSpec::new(&binding.queue, durable))
            .await?;

        if !binding.exchange.is_empty() {
            let exchange = self
                .topology
                .exchange(&binding.exchange)
                .unwrap_or_else(|| ExchangeSpec::new(&binding.exchange, ExchangeKind::Topic, true));
            channel.declare_exchange(&exchange).await?;
            channel.bind_queue(binding).await?;
        }
        log_topology_operation("redeclare", "subscription", &binding.queue, "success");
        Ok(())
    }

    /// Publish a JSON message as given, assigning a message id only when absent
    pub async fn publish_message(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Value,
    ) -> BrokerResult<(MessageId, Value)> {
        let (message_id, message) = ensure_message_identity(message);
        let body = serde_json::to_vec(&message)?;
        let properties = PublishProperties {
            message_id: Some(message_id.to_string()),
            timestamp: u64::try_from(chrono::Utc::now().timestamp()).ok(),
            ..PublishProperties::default()
        };

        self.publish_bytes(exchange, routing_key, &body, properties)
            .await?;
        log_publish_operation(
            "management_api",
            exchange,
            routing_key,
            Some(message_id.as_str()),
            "published",
        );
        Ok((message_id, message))
    }

    /// Publish a prepared body, declaring a missing exchange as a durable topic first
    pub async fn publish_bytes(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: PublishProperties,
    ) -> BrokerResult<()> {
        self.ensure_exchange(exchange, ExchangeKind::Topic).await?;
        let properties = &properties;
        self.with_channel(move |ch| async move {
            ch.publish(exchange, routing_key, body, properties.clone())
                .await
        })
        .await
    }

    /// Declare the bootstrap topology: topic exchange `default`, queue `default`, bound with `#`
    pub async fn bootstrap_default_topology(&self) -> BrokerResult<()> {
        self.create_exchange(DEFAULT_TOPOLOGY_NAME, ExchangeKind::Topic, true)
            .await?;
        self.create_queue(DEFAULT_TOPOLOGY_NAME, true).await?;
        self.bind(
            DEFAULT_TOPOLOGY_NAME,
            DEFAULT_TOPOLOGY_NAME,
            DEFAULT_ROUTING_KEY,
        )
        .await?;
        Ok(())
    }

    pub fn list_exchanges(&self) -> Vec<ExchangeSpec> {
        self.topology.list_exchanges()
    }

    pub fn list_queues(&self) -> Vec<QueueSpec> {
        self.topology.list_queues()
    }

    pub fn list_bindings(&self) -> Vec<BindingSpec> {
        self.topology.list_bindings()
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        self.topology.snapshot()
    }

    pub async fn health(&self) -> BrokerHealth {
        let snapshot = self.topology.snapshot();
        BrokerHealth {
            provider: self.connection.provider_name().to_string(),
            connected: self.connection.is_connected().await,
            generation: self.connection.current_generation().await,
            reconnects: self.connection.reconnect_count(),
            exchanges: snapshot.exchanges.len(),
            queues: snapshot.queues.len(),
            bindings: snapshot.bindings.len(),
        }
    }

    /// Close the channel; later operations reopen one
    pub async fn close(&self) -> BrokerResult<()> {
        self.connection.close().await
    }

    /// Close for good, cancelling any reconnect in progress
    pub async fn shutdown(&self) -> BrokerResult<()> {
        self.connection.shutdown().await
    }
}

fn outcome_label(outcome: DeclareOutcome) -> &'static str {
    match outcome {
        DeclareOutcome::Created => "created",
        DeclareOutcome::AlreadyDeclared => "already_declared",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::providers::InMemoryBroker;
    use serde_json::json;

    fn broker(memory: &InMemoryBroker) -> Broker {
        Broker::new(Arc::new(memory.clone()), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_bootstrap_default_topology() {
        let memory = InMemoryBroker::new();
        let broker = broker(&memory);
        broker.bootstrap_default_topology().await.unwrap();

        assert!(memory.has_exchange("default"));
        assert!(memory.has_queue("default"));
        assert_eq!(broker.list_bindings(), vec![BindingSpec::new("default", "default", "#")]);

        broker
            .publish_message("default", "anything.at.all", json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(memory.queue_depth("default"), 1);
    }

    #[tokio::test]
    async fn test_network_failure_rolls_back_store() {
        let memory = InMemoryBroker::new();
        let broker = broker(&memory);
        broker.create_queue("q", true).await.unwrap();

        memory.disconnect_all();
        memory.fail_next_connects(1);

        let result = broker.create_exchange("orders", ExchangeKind::Topic, true).await;
        assert!(matches!(result, Err(BrokerError::Connection { .. })));
        assert!(!broker.topology().has_exchange("orders"));

        // Broker is reachable again: the rolled-back record is declared for real
        let outcome = broker
            .create_exchange("orders", ExchangeKind::Topic, true)
            .await
            .unwrap();
        assert!(outcome.is_created());
        assert!(memory.has_exchange("orders"));
    }

    #[tokio::test]
    async fn test_publish_preserves_existing_message_id() {
        let memory = InMemoryBroker::new();
        let broker = broker(&memory);
        broker.create_queue("direct", true).await.unwrap();

        let (id, body) = broker
            .publish_message("", "direct", json!({"message_id": "fixed-id", "v": 2}))
            .await
            .unwrap();
        assert_eq!(id.as_str(), "fixed-id");
        assert_eq!(body["v"], 2);

        let channel = memory.connect().await.unwrap();
        let delivery = channel.get("direct").await.unwrap().unwrap();
        assert_eq!(delivery.properties.message_id.as_deref(), Some("fixed-id"));
    }

    #[tokio::test]
    async fn test_operation_retries_after_disconnect() {
        let memory = InMemoryBroker::new();
        let broker = broker(&memory);
        broker.bootstrap_default_topology().await.unwrap();

        memory.disconnect_all();
        broker
            .publish_message("default", "k", json!({"after": "reconnect"}))
            .await
            .unwrap();

        assert_eq!(memory.queue_depth("default"), 1);
        assert_eq!(broker.health().await.generation, 2);
    }

    #[tokio::test]
    async fn test_health_reports_topology() {
        let memory = InMemoryBroker::new();
        let broker = broker(&memory);
        broker.bootstrap_default_topology().await.unwrap();

        let health = broker.health().await;
        assert!(health.connected);
        assert_eq!(health.provider, "in_memory");
        assert_eq!((health.exchanges, health.queues, health.bindings), (1, 1, 1));
    }
}
