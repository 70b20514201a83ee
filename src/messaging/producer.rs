//! # Producer
//!
//! Stamps payloads into [`MessageEnvelope`]s and publishes them through an ordered list of
//! [`PublishStrategy`] implementations:
//!
//! 1. [`ManagementApiStrategy`]: `POST /messages` on the management service
//! 2. [`DirectStrategy`]: straight onto the broker through the connection manager
//!
//! Any failure of the management path (transport error or non-2xx) falls back to the
//! direct path exactly once. When every strategy fails the caller gets a single
//! [`BrokerError::Publish`] listing each attempt's reason.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::broker::Broker;
use super::envelope::MessageEnvelope;
use super::management_client::ManagementClient;
use super::types::{ExchangeKind, MessageId, PublishProperties};
use crate::config::AppConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::logging::log_publish_operation;

/// One way of getting an envelope onto the broker
#[async_trait]
pub trait PublishStrategy: Send + Sync + Debug {
    /// Name used in logs and failure reports
    fn name(&self) -> &'static str;

    async fn publish(
        &self,
        envelope: &MessageEnvelope,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()>;

    async fn ensure_exchange(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()>;
}

/// Publish through the management HTTP service
#[derive(Debug, Clone)]
pub struct ManagementApiStrategy {
    client: ManagementClient,
}

impl ManagementApiStrategy {
    pub fn new(client: ManagementClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PublishStrategy for ManagementApiStrategy {
    fn name(&self) -> &'static str {
        "management_api"
    }

    async fn publish(
        &self,
        envelope: &MessageEnvelope,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        let assigned = self
            .client
            .publish_message(exchange, routing_key, envelope.to_value()?)
            .await?;
        if assigned != envelope.message_id {
            warn!(
                expected = %envelope.message_id,
                assigned = %assigned,
                "Management API reported a different message id"
            );
        }
        Ok(())
    }

    async fn ensure_exchange(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()> {
        match self.client.create_exchange(name, kind, true).await {
            Ok(_) => Ok(()),
            // Already declared with the same name; nothing left to do
            Err(BrokerError::TopologyConflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Publish straight onto the broker
#[derive(Debug, Clone)]
pub struct DirectStrategy {
    broker: Arc<Broker>,
}

impl DirectStrategy {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl PublishStrategy for DirectStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn publish(
        &self,
        envelope: &MessageEnvelope,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        let body = envelope.to_bytes()?;
        let properties = PublishProperties::persistent_json(&envelope.message_id, envelope.timestamp);
        self.broker
            .publish_bytes(exchange, routing_key, &body, properties)
            .await
    }

    async fn ensure_exchange(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()> {
        self.broker.ensure_exchange(name, kind).await
    }
}

/// Per-message result of [`Producer::publish_batch`]
#[derive(Debug, Clone)]
pub struct BatchFailure {
    /// Position of the payload in the batch
    pub index: usize,
    pub error: BrokerError,
}

/// Result of a batch publish; failures are reported, not retried
#[derive(Debug, Clone, Default)]
pub struct BatchPublishOutcome {
    pub message_ids: Vec<MessageId>,
    pub failures: Vec<BatchFailure>,
}

impl BatchPublishOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Publish counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub published: u64,
    pub fallbacks: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct ProducerCounters {
    published: AtomicU64,
    fallbacks: AtomicU64,
    failed: AtomicU64,
}

/// Event producer with management-API-first publishing
#[derive(Debug)]
pub struct Producer {
    producer_id: String,
    broker: Arc<Broker>,
    management: Option<Arc<dyn PublishStrategy>>,
    direct: Arc<dyn PublishStrategy>,
    prefer_management_api: bool,
    counters: ProducerCounters,
}

impl Producer {
    /// Producer with an explicit identity; `management` enables the API strategy
    pub fn new(
        producer_id: impl Into<String>,
        broker: Arc<Broker>,
        management: Option<ManagementClient>,
        prefer_management_api: bool,
    ) -> Self {
        Self {
            producer_id: producer_id.into(),
            direct: Arc::new(DirectStrategy::new(Arc::clone(&broker))),
            broker,
            management: management
                .map(|client| Arc::new(ManagementApiStrategy::new(client)) as Arc<dyn PublishStrategy>),
            prefer_management_api,
            counters: ProducerCounters::default(),
        }
    }

    /// Producer configured from `producer` and `management` settings
    pub fn from_config(config: &AppConfig, broker: Arc<Broker>) -> BrokerResult<Self> {
        let producer_id = config
            .producer
            .producer_id
            .clone()
            .unwrap_or_else(|| format!("producer-{}", uuid::Uuid::new_v4()));
        let client = ManagementClient::new(&config.management)?;
        Ok(Self::new(
            producer_id,
            broker,
            Some(client),
            config.producer.prefer_management_api,
        ))
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    /// Whether `publish_default` and batches try the management API first
    pub fn prefers_management_api(&self) -> bool {
        self.prefer_management_api && self.management.is_some()
    }

    fn strategies(&self, prefer_management_api: bool) -> Vec<Arc<dyn PublishStrategy>> {
        let mut strategies = Vec::with_capacity(2);
        if prefer_management_api {
            if let Some(management) = &self.management {
                strategies.push(Arc::clone(management));
            }
        }
        strategies.push(Arc::clone(&self.direct));
        strategies
    }

    /// Stamp `payload` and publish it, trying the management API first when asked to
    pub async fn publish(
        &self,
        payload: Value,
        exchange: &str,
        routing_key: &str,
        prefer_management_api: bool,
    ) -> BrokerResult<MessageId> {
        let envelope = MessageEnvelope::stamp(payload, &self.producer_id);
        self.publish_envelope(&envelope, exchange, routing_key, prefer_management_api)
            .await?;
        Ok(envelope.message_id)
    }

    /// [`publish`](Self::publish) with the configured path preference
    pub async fn publish_default(
        &self,
        payload: Value,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<MessageId> {
        self.publish(payload, exchange, routing_key, self.prefer_management_api)
            .await
    }

    /// Publish an already-stamped envelope
    pub async fn publish_envelope(
        &self,
        envelope: &MessageEnvelope,
        exchange: &str,
        routing_key: &str,
        prefer_management_api: bool,
    ) -> BrokerResult<()> {
        let mut attempts = Vec::new();

        for (position, strategy) in self
            .strategies(prefer_management_api)
            .into_iter()
            .enumerate()
        {
            match strategy.publish(envelope, exchange, routing_key).await {
                Ok(()) => {
                    self.counters.published.fetch_add(1, Ordering::Relaxed);
                    if position > 0 {
                        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                    }
                    log_publish_operation(
                        strategy.name(),
                        exchange,
                        routing_key,
                        Some(envelope.message_id.as_str()),
                        "published",
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        strategy = strategy.name(),
                        exchange = %exchange,
                        routing_key = %routing_key,
                        message_id = %envelope.message_id,
                        error = %e,
                        "Publish strategy failed"
                    );
                    attempts.push(format!("{}: {}", strategy.name(), e));
                }
            }
        }

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        log_publish_operation(
            "all",
            exchange,
            routing_key,
            Some(envelope.message_id.as_str()),
            "failed",
        );
        Err(BrokerError::publish(exchange, routing_key, attempts))
    }

    /// Publish each payload in order; partial failure is reported, not retried
    pub async fn publish_batch(
        &self,
        payloads: Vec<Value>,
        exchange: &str,
        routing_key: &str,
    ) -> BatchPublishOutcome {
        let mut outcome = BatchPublishOutcome::default();
        for (index, payload) in payloads.into_iter().enumerate() {
            match self.publish_default(payload, exchange, routing_key).await {
                Ok(id) => outcome.message_ids.push(id),
                Err(error) => outcome.failures.push(BatchFailure { index, error }),
            }
        }
        debug!(
            exchange = %exchange,
            published = outcome.message_ids.len(),
            failed = outcome.failures.len(),
            "Batch publish finished"
        );
        outcome
    }

    /// Make sure `name` exists, through the management API first when preferred
    pub async fn ensure_exchange(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()> {
        let mut attempts = Vec::new();
        for strategy in self.strategies(self.prefer_management_api) {
            match strategy.ensure_exchange(name, kind).await {
                Ok(()) => return Ok(()),
                Err(e) => attempts.push(format!("{}: {}", strategy.name(), e)),
            }
        }
        Err(BrokerError::configuration(
            "producer",
            format!("could not declare exchange '{name}': {}", attempts.join("; ")),
        ))
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            published: self.counters.published.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Close the producer's broker connection
    pub async fn close(&self) -> BrokerResult<()> {
        self.broker.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagementConfig;
    use crate::messaging::providers::InMemoryBroker;
    use crate::messaging::transport::BrokerConnector;
    use serde_json::json;
    use std::time::Duration;

    fn broker(memory: &InMemoryBroker) -> Arc<Broker> {
        Arc::new(Broker::new(Arc::new(memory.clone()), Duration::from_millis(10)))
    }

    fn unreachable_management() -> ManagementClient {
        ManagementClient::new(&ManagementConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            request_timeout_ms: 300,
            ..ManagementConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_direct_publish_stamps_envelope() {
        let memory = InMemoryBroker::new();
        let broker = broker(&memory);
        broker.create_queue("audit", true).await.unwrap();
        broker
            .create_exchange("order.events", ExchangeKind::Topic, true)
            .await
            .unwrap();
        broker.bind("audit", "order.events", "order.*").await.unwrap();

        let producer = Producer::new("svc-test", broker, None, false);
        let id = producer
            .publish(json!({"product_id": "P1"}), "order.events", "order.generated", false)
            .await
            .unwrap();

        let channel = memory.connect().await.unwrap();
        let delivery = channel.get("audit").await.unwrap().unwrap();
        let body: Value = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(body["message_id"], id.as_str());
        assert_eq!(body["producer_id"], "svc-test");
        assert_eq!(body["product_id"], "P1");
        assert!(delivery.properties.persistent);
        assert_eq!(delivery.properties.message_id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_unreachable_api_falls_back_to_direct() {
        let memory = InMemoryBroker::new();
        let broker = broker(&memory);
        broker.create_queue("work", true).await.unwrap();

        let producer = Producer::new("svc-test", broker, Some(unreachable_management()), true);
        producer
            .publish(json!("scalar"), "", "work", true)
            .await
            .unwrap();

        assert_eq!(memory.queue_depth("work"), 1);
        assert_eq!(
            producer.stats(),
            ProducerStats {
                published: 1,
                fallbacks: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_total_failure_reports_every_attempt() {
        let memory = InMemoryBroker::new();
        memory.fail_next_connects(u32::MAX);
        let producer = Producer::new("svc-test", broker(&memory), Some(unreachable_management()), true);

        let err = producer
            .publish(json!({"x": 1}), "order.events", "order.generated", true)
            .await
            .unwrap_err();
        match err {
            BrokerError::Publish { attempts, .. } => {
                assert_eq!(attempts.len(), 2);
                assert!(attempts[0].starts_with("management_api"));
                assert!(attempts[1].starts_with("direct"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(producer.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_batch_reports_partial_failure() {
        let memory = InMemoryBroker::new();
        let broker = broker(&memory);
        broker.create_queue("work", true).await.unwrap();
        let producer = Producer::new("svc-test", Arc::clone(&broker), None, false);

        let first = producer
            .publish_batch(vec![json!({"n": 1}), json!({"n": 2})], "", "work")
            .await;
        assert!(first.is_complete());
        assert_eq!(first.message_ids.len(), 2);
        assert_ne!(first.message_ids[0], first.message_ids[1]);

        broker.shutdown().await.unwrap();
        let second = producer
            .publish_batch(vec![json!({"n": 3})], "", "work")
            .await;
        assert_eq!(second.failures.len(), 1);
        assert_eq!(second.failures[0].index, 0);
    }
}
