//! # Consumer
//!
//! Registers handlers per queue and runs one receive loop (a tokio task) per queue.
//!
//! ## Delivery rules
//!
//! | Outcome | Broker action |
//! |---------|---------------|
//! | body is not valid JSON | `nack(requeue=false)`, never redelivered |
//! | handler returns `Ok` | `ack` |
//! | handler returns `Err` or panics | `nack(requeue=true)`, redelivered by the broker |
//!
//! There is no in-process retry: redelivery is the broker's job, bounded by its delivery
//! limit when one is configured. Subscriptions in [`AckMode::Auto`] skip the table: every
//! delivery is acked on receipt and a failed handler loses the message.
//!
//! ## Reconnection
//!
//! When a loop's delivery stream ends or errors while the consumer is running, the loop
//! asks the connection manager to reconnect, re-declares its own queue and binding once
//! on the new channel, and resumes consuming. [`Consumer::stop`] interrupts loops that are
//! waiting on a reconnect.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::Broker;
use super::connection::ChannelLease;
use super::envelope::{decode_body, message_id_of};
use super::transport::BrokerChannel;
use super::types::{BindingSpec, Delivery};
use crate::config::{AppConfig, ConsumerConfig};
use crate::error::{BrokerError, BrokerResult};
use crate::logging::log_consume_operation;

/// A decoded delivery handed to a [`MessageHandler`]
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    /// Envelope `message_id`, falling back to the AMQP property
    pub message_id: Option<String>,
    pub redelivered: bool,
    pub body: Value,
}

impl ConsumedMessage {
    /// Deserialize the body into a domain type
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> BrokerResult<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| BrokerError::decode(&self.queue, e.to_string()))
    }
}

/// Business logic invoked for every decoded message
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: ConsumedMessage) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(ConsumedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: ConsumedMessage) -> anyhow::Result<()> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(ConsumedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// What happened to one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Acked,
    Requeued,
    Rejected,
}

impl ProcessOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Requeued => "requeued",
            Self::Rejected => "rejected",
        }
    }
}

/// When a subscription acknowledges its deliveries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Settle after the handler returns, following the delivery rules
    #[default]
    Manual,
    /// Ack on receipt, before decoding (at most once)
    Auto,
}

/// Consumer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
struct ConsumerCounters {
    received: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
    reconnects: AtomicU64,
}

impl ConsumerCounters {
    fn record(&self, outcome: ProcessOutcome) {
        let counter = match outcome {
            ProcessOutcome::Acked => &self.acked,
            ProcessOutcome::Requeued => &self.requeued,
            ProcessOutcome::Rejected => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
struct Subscription {
    binding: BindingSpec,
    ack_mode: AckMode,
    handler: Arc<dyn MessageHandler>,
}

/// Everything a receive loop needs, cloned into its task
#[derive(Clone)]
struct LoopContext {
    consumer_id: String,
    binding: BindingSpec,
    ack_mode: AckMode,
    handler: Arc<dyn MessageHandler>,
    broker: Arc<Broker>,
    counters: Arc<ConsumerCounters>,
}

impl LoopContext {
    fn queue(&self) -> &str {
        &self.binding.queue
    }

    fn consumer_tag(&self) -> String {
        format!("{}-{}", self.consumer_id, self.binding.queue)
    }
}

/// Subscribes handlers to queues and drives their receive loops
pub struct Consumer {
    consumer_id: String,
    broker: Arc<Broker>,
    default_exchange: String,
    default_routing_key: String,
    subscriptions: parking_lot::Mutex<BTreeMap<String, Subscription>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    counters: Arc<ConsumerCounters>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("consumer_id", &self.consumer_id)
            .field("queues", &self.subscriptions.lock().keys().collect::<Vec<_>>())
            .field("is_running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl Consumer {
    pub fn new(consumer_id: impl Into<String>, broker: Arc<Broker>, config: &ConsumerConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            consumer_id: consumer_id.into(),
            broker,
            default_exchange: config.default_exchange.clone(),
            default_routing_key: config.default_routing_key.clone(),
            subscriptions: parking_lot::Mutex::new(BTreeMap::new()),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            stop_tx,
            counters: Arc::new(ConsumerCounters::default()),
        }
    }

    /// Consumer configured from the `consumer` section, with its own broker connection
    pub fn from_config(config: &AppConfig, broker: Arc<Broker>) -> Self {
        let consumer_id = config
            .consumer
            .consumer_id
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", uuid::Uuid::new_v4()));
        Self::new(consumer_id, broker, &config.consumer)
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Handle `queue`, bound to the default exchange with the default routing key
    pub async fn register_handler(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> BrokerResult<()> {
        let exchange = self.default_exchange.clone();
        let routing_key = self.default_routing_key.clone();
        self.subscribe(queue, &exchange, &routing_key, handler).await
    }

    /// Handle `queue`, bound to `exchange` with `routing_key`, settling manually
    pub async fn subscribe(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> BrokerResult<()> {
        self.subscribe_with_ack_mode(queue, exchange, routing_key, AckMode::Manual, handler)
            .await
    }

    /// Handle `queue` with an explicit [`AckMode`]
    ///
    /// Before `start`, registering a queue again replaces its handler and binding. On a
    /// running consumer the subscription is declared and its receive loop starts
    /// immediately; a queue that already has a loop is rejected.
    pub async fn subscribe_with_ack_mode(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        ack_mode: AckMode,
        handler: Arc<dyn MessageHandler>,
    ) -> BrokerResult<()> {
        if queue.trim().is_empty() {
            return Err(BrokerError::validation("queue", "queue name must not be empty"));
        }
        let subscription = Subscription {
            binding: BindingSpec::new(queue, exchange, routing_key),
            ack_mode,
            handler,
        };

        // Serializes against start/stop
        let mut tasks = self.tasks.lock().await;
        if !self.is_running() {
            debug!(
                consumer_id = %self.consumer_id,
                queue = %queue,
                exchange = %exchange,
                routing_key = %routing_key,
                ack_mode = ?ack_mode,
                "Handler registered"
            );
            self.subscriptions
                .lock()
                .insert(queue.to_string(), subscription);
            return Ok(());
        }

        if self.subscriptions.lock().contains_key(queue) {
            return Err(BrokerError::validation(
                "queue",
                format!("'{queue}' is already being consumed; stop the consumer to replace its handler"),
            ));
        }
        self.broker
            .declare_subscription(&subscription.binding)
            .await?;
        self.subscriptions
            .lock()
            .insert(queue.to_string(), subscription.clone());
        tasks.push(self.spawn_loop(subscription));
        Ok(())
    }

    /// Bindings of every registered queue
    pub fn subscriptions(&self) -> Vec<BindingSpec> {
        self.subscriptions
            .lock()
            .values()
            .map(|s| s.binding.clone())
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn context(&self, subscription: Subscription) -> LoopContext {
        LoopContext {
            consumer_id: self.consumer_id.clone(),
            binding: subscription.binding,
            ack_mode: subscription.ack_mode,
            handler: subscription.handler,
            broker: Arc::clone(&self.broker),
            counters: Arc::clone(&self.counters),
        }
    }

    /// Declare every subscription and spawn one receive loop per queue
    ///
    /// Calling `start` on a running consumer does nothing.
    pub async fn start(&self) -> BrokerResult<()> {
        let mut tasks = self.tasks.lock().await;
        if self.running.load(Ordering::SeqCst) {
            debug!(consumer_id = %self.consumer_id, "Consumer already running");
            return Ok(());
        }

        let subscriptions: Vec<Subscription> =
            self.subscriptions.lock().values().cloned().collect();
        for subscription in &subscriptions {
            self.broker
                .declare_subscription(&subscription.binding)
                .await?;
        }

        self.stop_tx.send_replace(false);
        for subscription in subscriptions {
            tasks.push(self.spawn_loop(subscription));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_loop(&self, subscription: Subscription) -> JoinHandle<()> {
        let ctx = self.context(subscription);
        let stop_rx = self.stop_tx.subscribe();
        info!(
            consumer_id = %ctx.consumer_id,
            queue = %ctx.queue(),
            ack_mode = ?ctx.ack_mode,
            "Starting receive loop"
        );
        tokio::spawn(run_receive_loop(ctx, stop_rx))
    }

    /// Signal every loop to stop, wait for them and close the connection
    ///
    /// A message being handled when `stop` is called is finished and acknowledged first.
    /// Safe to call when never started or already stopped.
    pub async fn stop(&self) -> BrokerResult<()> {
        let mut tasks = self.tasks.lock().await;
        self.stop_tx.send_replace(true);

        let handles: Vec<JoinHandle<()>> = tasks.drain(..).collect();
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(consumer_id = %self.consumer_id, error = %e, "Receive loop terminated abnormally");
            }
        }
        self.running.store(false, Ordering::SeqCst);

        if count > 0 {
            info!(consumer_id = %self.consumer_id, loops = count, "Consumer stopped");
        }
        self.broker.close().await
    }

    /// Fetch and process at most one message from `queue` (polling mode)
    ///
    /// Returns `Ok(None)` when the queue is empty. The same ack/nack rules as the
    /// receive loops apply.
    pub async fn process_one(&self, queue: &str) -> BrokerResult<Option<ProcessOutcome>> {
        let subscription = self
            .subscriptions
            .lock()
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::not_found("handler", queue))?;
        self.broker
            .declare_subscription(&subscription.binding)
            .await?;

        let ctx = self.context(subscription);
        let ctx = &ctx;
        self.broker
            .with_channel(move |channel| async move {
                match channel.get(ctx.queue()).await {
                    Ok(Some(delivery)) => {
                        Ok(Some(process_delivery(ctx, channel.as_ref(), delivery).await))
                    }
                    Ok(None) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.counters.received.load(Ordering::Relaxed),
            acked: self.counters.acked.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
        }
    }
}

async fn run_receive_loop(ctx: LoopContext, mut stop_rx: watch::Receiver<bool>) {
    let initial = match ctx.broker.connection().acquire().await {
        Ok(lease) => Some(lease),
        Err(e) => {
            warn!(queue = %ctx.queue(), error = %e, "Initial channel unavailable, reconnecting");
            let generation = ctx.broker.connection().current_generation().await;
            recover(&ctx, &mut stop_rx, generation).await
        }
    };
    let Some(mut lease) = initial else {
        return;
    };

    let consumer_tag = ctx.consumer_tag();
    'outer: loop {
        if *stop_rx.borrow() {
            break;
        }

        match lease.channel.consume(ctx.queue(), &consumer_tag).await {
            Ok(mut stream) => loop {
                tokio::select! {
                    _ = stop_rx.changed() => break 'outer,
                    next = stream.next() => match next {
                        Some(Ok(delivery)) => {
                            process_delivery(&ctx, lease.channel.as_ref(), delivery).await;
                        }
                        Some(Err(e)) => {
                            warn!(queue = %ctx.queue(), error = %e, "Delivery stream failed");
                            break;
                        }
                        None => {
                            debug!(queue = %ctx.queue(), "Delivery stream ended");
                            break;
                        }
                    }
                }
            },
            Err(e) => {
                warn!(queue = %ctx.queue(), error = %e, "Failed to start consuming");
            }
        }

        if *stop_rx.borrow() {
            break;
        }
        match recover(&ctx, &mut stop_rx, lease.generation).await {
            Some(fresh) => lease = fresh,
            None => break,
        }
    }

    debug!(queue = %ctx.queue(), "Receive loop exited");
}

/// Reconnect and re-declare this loop's subscription; `None` when stopping
async fn recover(
    ctx: &LoopContext,
    stop_rx: &mut watch::Receiver<bool>,
    mut generation: u64,
) -> Option<ChannelLease> {
    loop {
        let reconnected = tokio::select! {
            result = ctx.broker.connection().reconnect(generation) => result,
            _ = stop_rx.changed() => return None,
        };

        let lease = match reconnected {
            Ok(lease) => lease,
            Err(BrokerError::Shutdown) => return None,
            Err(e) => {
                error!(queue = %ctx.queue(), error = %e, "Reconnect failed");
                return None;
            }
        };

        match ctx
            .broker
            .redeclare_subscription(lease.channel.as_ref(), &ctx.binding)
            .await
        {
            Ok(()) => {
                ctx.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                info!(
                    consumer_id = %ctx.consumer_id,
                    queue = %ctx.queue(),
                    generation = lease.generation,
                    "Receive loop resumed after reconnect"
                );
                return Some(lease);
            }
            Err(e) => {
                warn!(
                    queue = %ctx.queue(),
                    error = %e,
                    "Re-declaring subscription failed, reconnecting again"
                );
                ctx.broker.connection().invalidate(lease.generation).await;
                generation = lease.generation;
            }
        }
    }
}

/// Decode, dispatch and settle one delivery
async fn process_delivery(
    ctx: &LoopContext,
    channel: &dyn BrokerChannel,
    delivery: Delivery,
) -> ProcessOutcome {
    ctx.counters.received.fetch_add(1, Ordering::Relaxed);
    let queue = ctx.queue();
    let tag = delivery.delivery_tag;

    if ctx.ack_mode == AckMode::Auto {
        settle(ctx, channel, tag, ProcessOutcome::Acked).await;
    }

    let body = match decode_body(queue, &delivery.body) {
        Ok(body) => body,
        Err(e) => {
            let outcome = finish(ctx, channel, tag, ProcessOutcome::Rejected).await;
            log_consume_operation(
                &ctx.consumer_id,
                queue,
                delivery.properties.message_id.as_deref(),
                outcome.as_str(),
                Some(&e.to_string()),
            );
            return outcome;
        }
    };

    let message_id = message_id_of(&body)
        .map(str::to_string)
        .or_else(|| delivery.properties.message_id.clone());
    let message = ConsumedMessage {
        queue: queue.to_string(),
        exchange: delivery.exchange,
        routing_key: delivery.routing_key,
        message_id: message_id.clone(),
        redelivered: delivery.redelivered,
        body,
    };

    let result = AssertUnwindSafe(ctx.handler.handle(message))
        .catch_unwind()
        .await;
    let (outcome, details) = match result {
        Ok(Ok(())) => (ProcessOutcome::Acked, None),
        Ok(Err(e)) => (ProcessOutcome::Requeued, Some(format!("{e:#}"))),
        Err(_) => (ProcessOutcome::Requeued, Some("handler panicked".to_string())),
    };

    let outcome = finish(ctx, channel, tag, outcome).await;
    log_consume_operation(
        &ctx.consumer_id,
        queue,
        message_id.as_deref(),
        outcome.as_str(),
        details.as_deref(),
    );
    outcome
}

/// Settle per the subscription's ack mode and return what the broker was told
async fn finish(
    ctx: &LoopContext,
    channel: &dyn BrokerChannel,
    tag: u64,
    outcome: ProcessOutcome,
) -> ProcessOutcome {
    match ctx.ack_mode {
        AckMode::Manual => {
            settle(ctx, channel, tag, outcome).await;
            outcome
        }
        // Already acked on receipt
        AckMode::Auto => ProcessOutcome::Acked,
    }
}

async fn settle(ctx: &LoopContext, channel: &dyn BrokerChannel, tag: u64, outcome: ProcessOutcome) {
    let result = match outcome {
        ProcessOutcome::Acked => channel.ack(tag).await,
        ProcessOutcome::Requeued => channel.nack(tag, true).await,
        ProcessOutcome::Rejected => channel.nack(tag, false).await,
    };
    match result {
        Ok(()) => ctx.counters.record(outcome),
        // The broker requeues unsettled messages of a closed channel
        Err(e) => warn!(
            queue = %ctx.queue(),
            delivery_tag = tag,
            outcome = outcome.as_str(),
            error = %e,
            "Failed to settle delivery, it will be redelivered"
        ),
    }
}
