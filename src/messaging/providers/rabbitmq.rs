//! # RabbitMQ Transport
//!
//! [`BrokerConnector`] implementation over the `lapin` crate (AMQP 0.9.1).
//!
//! ## Features
//!
//! - **Publisher confirms**: `publish` resolves only after the broker acked the message
//! - **Prefetch control**: `basic.qos` from `rabbitmq.prefetch_count`
//! - **Delivery limit**: when `rabbitmq.delivery_limit` is set, durable queues are declared
//!   as quorum queues with `x-delivery-limit`, so the broker drops a message that keeps
//!   being requeued
//!
//! Each `connect()` opens a dedicated connection with a single channel. Channel-level
//! protocol errors close the channel; every later call then reports a connection error,
//! which the connection manager answers with a reconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info, warn};

use crate::config::RabbitmqConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::messaging::transport::{BrokerChannel, BrokerConnector, DeliveryStream};
use crate::messaging::types::{
    BindingSpec, Delivery, ExchangeKind, ExchangeSpec, PublishProperties, QueueSpec,
};

const CONNECTION_NAME: &str = "demand-broker";

/// Opens lapin connections from a [`RabbitmqConfig`]
#[derive(Debug, Clone)]
pub struct RabbitMqConnector {
    config: RabbitmqConfig,
}

impl RabbitMqConnector {
    pub fn new(config: RabbitmqConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RabbitmqConfig {
        &self.config
    }

    /// Connection URL with the configured heartbeat applied unless the URL sets one
    fn connection_url(&self) -> String {
        let url = &self.config.url;
        if url.contains("heartbeat=") {
            return url.clone();
        }
        let separator = if url.contains('?') { '&' } else { '?' };
        format!("{url}{separator}heartbeat={}", self.config.heartbeat_seconds)
    }
}

#[async_trait]
impl BrokerConnector for RabbitMqConnector {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let timeout = Duration::from_secs(self.config.connection_timeout_seconds);
        let connection = tokio::time::timeout(
            timeout,
            Connection::connect(
                &self.connection_url(),
                ConnectionProperties::default().with_connection_name(CONNECTION_NAME.into()),
            ),
        )
        .await
        .map_err(|_| {
            BrokerError::connection(format!(
                "RabbitMQ connection timed out after {}s",
                timeout.as_secs()
            ))
        })?
        .map_err(|e| BrokerError::connection(format!("RabbitMQ connection failed: {e}")))?;

        let channel = connection.create_channel().await.map_err(|e| {
            BrokerError::connection(format!("RabbitMQ channel creation failed: {e}"))
        })?;

        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::configuration("rabbitmq", format!("Failed to set QoS: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                BrokerError::configuration(
                    "rabbitmq",
                    format!("Failed to enable publisher confirms: {e}"),
                )
            })?;

        info!(
            url = %self.config.url_redacted(),
            prefetch_count = self.config.prefetch_count,
            delivery_limit = ?self.config.delivery_limit,
            "Connected to RabbitMQ"
        );

        Ok(Arc::new(RabbitMqChannel {
            connection,
            channel,
            delivery_limit: self.config.delivery_limit,
        }))
    }

    fn provider_name(&self) -> &'static str {
        "rabbitmq"
    }
}

/// One lapin connection and its channel
#[derive(Debug)]
pub struct RabbitMqChannel {
    connection: Connection,
    channel: Channel,
    delivery_limit: Option<u32>,
}

impl RabbitMqChannel {
    fn queue_arguments(&self, spec: &QueueSpec) -> FieldTable {
        let mut args = FieldTable::default();
        if let Some(limit) = self.delivery_limit.filter(|_| spec.durable) {
            args.insert(
                "x-queue-type".into(),
                AMQPValue::LongString("quorum".into()),
            );
            args.insert(
                "x-delivery-limit".into(),
                AMQPValue::LongInt(i32::try_from(limit).unwrap_or(i32::MAX)),
            );
        }
        args
    }
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

/// Attach the resource identity to conflicts and missing-resource errors
fn declare_error(err: lapin::Error, resource: &str, name: &str) -> BrokerError {
    match BrokerError::from(err) {
        BrokerError::TopologyConflict { message, .. } => {
            BrokerError::topology_conflict(resource, name, message)
        }
        BrokerError::NotFound { .. } => BrokerError::not_found(resource, name),
        other => other,
    }
}

fn to_properties(properties: PublishProperties) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_content_type(properties.content_type.as_str().into())
        .with_delivery_mode(if properties.persistent { 2 } else { 1 });
    if let Some(message_id) = properties.message_id {
        props = props.with_message_id(message_id.as_str().into());
    }
    if let Some(timestamp) = properties.timestamp {
        props = props.with_timestamp(timestamp);
    }
    props
}

fn from_properties(properties: &BasicProperties) -> PublishProperties {
    PublishProperties {
        message_id: properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        timestamp: *properties.timestamp(),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().to_string())
            .unwrap_or_else(|| "application/json".to_string()),
        persistent: *properties.delivery_mode() == Some(2),
    }
}

fn to_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: from_properties(&delivery.properties),
        body: delivery.data,
    }
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()> {
        self.channel
            .exchange_declare(
                &spec.name,
                lapin_kind(spec.kind),
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(e, "exchange", &spec.name))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()> {
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                self.queue_arguments(spec),
            )
            .await
            .map(|_| ())
            .map_err(|e| declare_error(e, "queue", &spec.name))
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> BrokerResult<()> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                declare_error(
                    e,
                    "binding",
                    &format!("{} -> {}", binding.queue, binding.exchange),
                )
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: PublishProperties,
    ) -> BrokerResult<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_properties(properties),
            )
            .await?;

        let confirmation = confirm.await?;
        if confirmation.is_nack() {
            return Err(BrokerError::channel(
                "basic.publish",
                format!("broker nacked publish to '{exchange}' with key '{routing_key}'"),
            ));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(e, "queue", queue))?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, "RabbitMQ consumer started");
        Ok(Box::pin(consumer.map(|result| {
            result.map(to_delivery).map_err(BrokerError::from)
        })))
    }

    async fn get(&self, queue: &str) -> BrokerResult<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| declare_error(e, "queue", queue))?;
        Ok(message.map(|m| to_delivery(m.delivery)))
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    multiple: false,
                },
            )
            .await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "closing").await {
                warn!(error = %e, "Failed to close RabbitMQ channel cleanly");
            }
        }
        if self.connection.status().connected() {
            self.connection.close(200, "closing").await?;
        }
        Ok(())
    }
}
