//! # In-Memory Broker
//!
//! Complete in-process model of the AMQP 0.9.1 behaviour the messaging layer relies on,
//! used by tests and local development.
//!
//! ## Features
//!
//! - **Routing**: default exchange (`""` routes to the queue named by the routing key),
//!   direct, fanout, topic (`*` one word, `#` zero or more words). Headers exchanges route
//!   like fanout since bindings carry no header arguments.
//! - **Acknowledgement**: deliveries stay unacked until `ack`/`nack`; `nack(requeue=true)`
//!   puts the message back at the head of its queue with `redelivered = true`.
//! - **Delivery limit**: with a limit configured, a message that has been delivered
//!   `1 + limit` times and is nacked again is dead-lettered instead of requeued.
//! - **Fault injection**: [`InMemoryBroker::disconnect_all`] drops every open channel
//!   (unacked messages are requeued as redelivered) and
//!   [`InMemoryBroker::fail_next_connects`] makes connection attempts fail.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::RabbitmqConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::messaging::transport::{BrokerChannel, BrokerConnector, DeliveryStream};
use crate::messaging::types::{
    BindingSpec, Delivery, ExchangeKind, ExchangeSpec, PublishProperties, QueueSpec,
};

/// How long an idle consume stream waits before re-checking its queue
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Why a message left its queue without being acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Nacked without requeue
    Rejected,
    /// Nacked for requeue after exhausting the delivery limit
    DeliveryLimit,
}

/// A message removed from circulation
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub queue: String,
    pub body: Vec<u8>,
    pub delivery_count: u32,
    pub reason: DeadLetterReason,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: PublishProperties,
    body: Vec<u8>,
    delivery_count: u32,
    redelivered: bool,
}

#[derive(Debug)]
struct MemQueue {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug)]
struct Unacked {
    channel_id: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemQueue>,
    bindings: Vec<BindingSpec>,
    unacked: HashMap<u64, Unacked>,
    open_channels: HashSet<u64>,
    dead_letters: Vec<DeadLetter>,
    declare_counts: HashMap<String, usize>,
    next_delivery_tag: u64,
    published: u64,
}

impl BrokerState {
    /// Put every message the channel holds back at the head of its queue
    fn requeue_channel(&mut self, channel_id: u64) -> usize {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        // Highest tag first so push_front restores the original order
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let count = tags.len();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
        }
        count
    }

    fn route_targets(&self, exchange: &ExchangeSpec, routing_key: &str) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange.name) {
            let matched = match exchange.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }

    fn bump_declare(&mut self, key: String) {
        *self.declare_counts.entry(key).or_insert(0) += 1;
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
    delivery_limit: Option<u32>,
    failing_connects: AtomicU32,
    connect_attempts: AtomicU64,
    next_channel_id: AtomicU64,
}

enum Take {
    Ready(Delivery),
    Empty,
    Closed,
}

impl Inner {
    fn is_open(&self, channel_id: u64) -> bool {
        self.state.lock().open_channels.contains(&channel_id)
    }

    fn ensure_open(&self, channel_id: u64, operation: &str) -> BrokerResult<()> {
        if self.is_open(channel_id) {
            Ok(())
        } else {
            Err(BrokerError::connection(format!(
                "channel {channel_id} is closed ({operation})"
            )))
        }
    }

    fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: PublishProperties,
    ) -> BrokerResult<usize> {
        let mut state = self.state.lock();
        state.published += 1;

        let targets = if exchange.is_empty() {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let spec = state
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::not_found("exchange", exchange))?;
            state.route_targets(spec, routing_key)
        };

        for queue_name in &targets {
            if let Some(queue) = state.queues.get_mut(queue_name) {
                queue.ready.push_back(StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    properties: properties.clone(),
                    body: body.to_vec(),
                    delivery_count: 0,
                    redelivered: false,
                });
            }
        }
        drop(state);

        if !targets.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(targets.len())
    }

    fn take_next(&self, channel_id: u64, queue_name: &str) -> Take {
        let mut state = self.state.lock();
        if !state.open_channels.contains(&channel_id) {
            return Take::Closed;
        }
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return Take::Closed;
        };
        let Some(mut message) = queue.ready.pop_front() else {
            return Take::Empty;
        };

        message.delivery_count += 1;
        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;
        let delivery = Delivery {
            delivery_tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            properties: message.properties.clone(),
            body: message.body.clone(),
        };
        state.unacked.insert(
            delivery_tag,
            Unacked {
                channel_id,
                queue: queue_name.to_string(),
                message,
            },
        );
        Take::Ready(delivery)
    }
}

/// In-process broker implementing [`BrokerConnector`]
///
/// Cloning yields another handle to the same broker.
///
/// # Example
///
/// ```rust
/// use demand_broker::messaging::providers::InMemoryBroker;
/// use demand_broker::messaging::transport::BrokerConnector;
/// use demand_broker::messaging::types::{BindingSpec, ExchangeKind, ExchangeSpec, PublishProperties, QueueSpec};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// let channel = broker.connect().await?;
///
/// channel.declare_exchange(&ExchangeSpec::new("orders", ExchangeKind::Topic, true)).await?;
/// channel.declare_queue(&QueueSpec::new("audit", true)).await?;
/// channel.bind_queue(&BindingSpec::new("audit", "orders", "order.*")).await?;
/// channel.publish("orders", "order.generated", b"{}", PublishProperties::default()).await?;
///
/// assert_eq!(broker.queue_depth("audit"), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Broker with unbounded redelivery
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Broker that dead-letters messages after `1 + limit` failed deliveries
    pub fn with_delivery_limit(limit: u32) -> Self {
        Self::build(Some(limit))
    }

    /// Broker mirroring the redelivery policy of a RabbitMQ configuration
    pub fn from_config(config: &RabbitmqConfig) -> Self {
        Self::build(config.delivery_limit)
    }

    fn build(delivery_limit: Option<u32>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                delivery_limit,
                failing_connects: AtomicU32::new(0),
                connect_attempts: AtomicU64::new(0),
                next_channel_id: AtomicU64::new(1),
            }),
        }
    }

    /// Drop every open channel, requeueing their unacked messages as redelivered
    pub fn disconnect_all(&self) {
        let mut state = self.inner.state.lock();
        let channels: Vec<u64> = state.open_channels.drain().collect();
        let requeued: usize = channels
            .iter()
            .map(|id| state.requeue_channel(*id))
            .sum();
        drop(state);

        self.inner.notify.notify_waiters();
        info!(
            channels = channels.len(),
            requeued = requeued,
            "In-memory broker dropped all connections"
        );
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Total connection attempts, successful or not
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of channels currently open
    pub fn open_channels(&self) -> usize {
        self.inner.state.lock().open_channels.len()
    }

    /// Publish without going through a channel (test fixtures, raw payloads)
    pub fn publish_raw(&self, exchange: &str, routing_key: &str, body: &[u8]) -> BrokerResult<usize> {
        self.inner
            .route(exchange, routing_key, body, PublishProperties::default())
    }

    /// Messages ready for delivery on `queue`
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Messages delivered but not yet acknowledged, across all queues
    pub fn unacked_count(&self) -> usize {
        self.inner.state.lock().unacked.len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.state.lock().dead_letters.clone()
    }

    /// Messages accepted by `publish`, routed or not
    pub fn published_count(&self) -> u64 {
        self.inner.state.lock().published
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.inner.state.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.state.lock().queues.contains_key(name)
    }

    pub fn bindings(&self) -> Vec<BindingSpec> {
        self.inner.state.lock().bindings.clone()
    }

    /// How many times `queue` has been declared, including idempotent redeclares
    pub fn queue_declare_count(&self, queue: &str) -> usize {
        self.declare_count(&format!("queue:{queue}"))
    }

    /// How many times `binding` has been declared, including idempotent redeclares
    pub fn binding_declare_count(&self, binding: &BindingSpec) -> usize {
        self.declare_count(&binding_key(binding))
    }

    fn declare_count(&self, key: &str) -> usize {
        self.inner
            .state
            .lock()
            .declare_counts
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

fn binding_key(binding: &BindingSpec) -> String {
    format!(
        "binding:{}:{}:{}",
        binding.queue, binding.exchange, binding.routing_key
    )
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(BrokerError::connection("in-memory broker refused connection"));
        }

        let id = self.inner.next_channel_id.fetch_add(1, Ordering::SeqCst);
        self.inner.state.lock().open_channels.insert(id);
        debug!(channel_id = id, "In-memory channel opened");

        Ok(Arc::new(InMemoryChannel {
            id,
            inner: Arc::clone(&self.inner),
        }))
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

/// Channel handed out by [`InMemoryBroker`]
#[derive(Debug)]
pub struct InMemoryChannel {
    id: u64,
    inner: Arc<Inner>,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()> {
        self.inner.ensure_open(self.id, "exchange.declare")?;
        let mut state = self.inner.state.lock();
        if let Some(existing) = state.exchanges.get(&spec.name) {
            if existing.kind != spec.kind || existing.durable != spec.durable {
                return Err(BrokerError::topology_conflict(
                    "exchange",
                    &spec.name,
                    format!(
                        "PRECONDITION_FAILED: declared as {} (durable={}), requested {} (durable={})",
                        existing.kind, existing.durable, spec.kind, spec.durable
                    ),
                ));
            }
        } else {
            state.exchanges.insert(spec.name.clone(), spec.clone());
        }
        state.bump_declare(format!("exchange:{}", spec.name));
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()> {
        self.inner.ensure_open(self.id, "queue.declare")?;
        let mut state = self.inner.state.lock();
        if let Some(existing) = state.queues.get(&spec.name) {
            if existing.spec.durable != spec.durable {
                return Err(BrokerError::topology_conflict(
                    "queue",
                    &spec.name,
                    format!(
                        "PRECONDITION_FAILED: durable={} conflicts with existing durable={}",
                        spec.durable, existing.spec.durable
                    ),
                ));
            }
        } else {
            state.queues.insert(
                spec.name.clone(),
                MemQueue {
                    spec: spec.clone(),
                    ready: VecDeque::new(),
                },
            );
        }
        state.bump_declare(format!("queue:{}", spec.name));
        Ok(())
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> BrokerResult<()> {
        self.inner.ensure_open(self.id, "queue.bind")?;
        let mut state = self.inner.state.lock();
        if !state.queues.contains_key(&binding.queue) {
            return Err(BrokerError::not_found("queue", &binding.queue));
        }
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BrokerError::not_found("exchange", &binding.exchange));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        state.bump_declare(binding_key(binding));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: PublishProperties,
    ) -> BrokerResult<()> {
        self.inner.ensure_open(self.id, "basic.publish")?;
        let routed = self.inner.route(exchange, routing_key, body, properties)?;
        if routed == 0 {
            debug!(
                exchange = %exchange,
                routing_key = %routing_key,
                "Message was unroutable and has been dropped"
            );
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        self.inner.ensure_open(self.id, "basic.consume")?;
        if !self.inner.state.lock().queues.contains_key(queue) {
            return Err(BrokerError::not_found("queue", queue));
        }
        debug!(channel_id = self.id, queue = %queue, consumer_tag = %consumer_tag, "In-memory consumer started");

        let stream = futures::stream::unfold(
            (Arc::clone(&self.inner), self.id, queue.to_string()),
            |(inner, channel_id, queue)| async move {
                loop {
                    match inner.take_next(channel_id, &queue) {
                        Take::Ready(delivery) => {
                            return Some((Ok(delivery), (inner, channel_id, queue)))
                        }
                        Take::Closed => return None,
                        Take::Empty => {
                            let _ = tokio::time::timeout(POLL_INTERVAL, inner.notify.notified())
                                .await;
                        }
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn get(&self, queue: &str) -> BrokerResult<Option<Delivery>> {
        self.inner.ensure_open(self.id, "basic.get")?;
        if !self.inner.state.lock().queues.contains_key(queue) {
            return Err(BrokerError::not_found("queue", queue));
        }
        match self.inner.take_next(self.id, queue) {
            Take::Ready(delivery) => Ok(Some(delivery)),
            Take::Empty => Ok(None),
            Take::Closed => Err(BrokerError::connection("channel closed during basic.get")),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.inner.ensure_open(self.id, "basic.ack")?;
        let mut state = self.inner.state.lock();
        match state.unacked.get(&delivery_tag) {
            Some(unacked) if unacked.channel_id == self.id => {
                state.unacked.remove(&delivery_tag);
                Ok(())
            }
            _ => Err(BrokerError::channel(
                "basic.ack",
                format!("PRECONDITION_FAILED: unknown delivery tag {delivery_tag}"),
            )),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.inner.ensure_open(self.id, "basic.nack")?;
        let mut state = self.inner.state.lock();
        let owned = matches!(state.unacked.get(&delivery_tag), Some(u) if u.channel_id == self.id);
        let Some(unacked) = owned
            .then(|| state.unacked.remove(&delivery_tag))
            .flatten()
        else {
            return Err(BrokerError::channel(
                "basic.nack",
                format!("PRECONDITION_FAILED: unknown delivery tag {delivery_tag}"),
            ));
        };

        let exhausted = self
            .inner
            .delivery_limit
            .is_some_and(|limit| unacked.message.delivery_count > limit);

        if requeue && !exhausted {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            drop(state);
            self.inner.notify.notify_waiters();
        } else {
            let reason = if requeue {
                DeadLetterReason::DeliveryLimit
            } else {
                DeadLetterReason::Rejected
            };
            debug!(
                queue = %unacked.queue,
                delivery_count = unacked.message.delivery_count,
                reason = ?reason,
                "Message dead-lettered"
            );
            state.dead_letters.push(DeadLetter {
                queue: unacked.queue,
                body: unacked.message.body,
                delivery_count: unacked.message.delivery_count,
                reason,
            });
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.is_open(self.id)
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut state = self.inner.state.lock();
        if state.open_channels.remove(&self.id) {
            state.requeue_channel(self.id);
        }
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

/// AMQP topic pattern matching: words are `.`-separated, `*` matches exactly one word
/// and `#` matches zero or more words
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    match_words(&topic_words(pattern), &topic_words(routing_key))
}

/// An empty string is zero words, not one empty word
fn topic_words(value: &str) -> Vec<&str> {
    if value.is_empty() {
        Vec::new()
    } else {
        value.split('.').collect()
    }
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn topology(broker: &InMemoryBroker) -> Arc<dyn BrokerChannel> {
        let channel = broker.connect().await.unwrap();
        channel
            .declare_exchange(&ExchangeSpec::new("events", ExchangeKind::Topic, true))
            .await
            .unwrap();
        channel
            .declare_queue(&QueueSpec::new("work", true))
            .await
            .unwrap();
        channel
            .bind_queue(&BindingSpec::new("work", "events", "order.#"))
            .await
            .unwrap();
        channel
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("#", "order.generated"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("order.*", "order.generated"));
        assert!(!topic_matches("order.*", "order.generated.v2"));
        assert!(topic_matches("order.#", "order"));
        assert!(topic_matches("order.#", "order.generated.v2"));
        assert!(topic_matches("*.reserved", "stock.reserved"));
        assert!(!topic_matches("stock.reserved", "stock.released"));
        assert!(topic_matches("a.#.z", "a.b.c.z"));
        assert!(!topic_matches("a.#.z", "a.b.c"));
    }

    #[test]
    fn test_empty_topic_pattern_matches_empty_key() {
        assert!(topic_matches("", ""));
        assert!(!topic_matches("", "order.generated"));
        assert!(!topic_matches("order", ""));
        assert!(!topic_matches("*", ""));
    }

    #[tokio::test]
    async fn test_empty_binding_key_routes_empty_routing_key() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        channel
            .declare_exchange(&ExchangeSpec::new("events", ExchangeKind::Topic, true))
            .await
            .unwrap();
        channel
            .declare_queue(&QueueSpec::new("blank", true))
            .await
            .unwrap();
        channel
            .bind_queue(&BindingSpec::new("blank", "events", ""))
            .await
            .unwrap();

        assert_eq!(broker.publish_raw("events", "", b"{}").unwrap(), 1);
        assert_eq!(broker.publish_raw("events", "order.generated", b"{}").unwrap(), 0);
        assert_eq!(broker.queue_depth("blank"), 1);
    }

    #[tokio::test]
    async fn test_routing_by_exchange_kind() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        for (name, kind) in [("d", ExchangeKind::Direct), ("f", ExchangeKind::Fanout)] {
            channel
                .declare_exchange(&ExchangeSpec::new(name, kind, true))
                .await
                .unwrap();
        }
        for queue in ["q1", "q2"] {
            channel.declare_queue(&QueueSpec::new(queue, true)).await.unwrap();
            channel
                .bind_queue(&BindingSpec::new(queue, "f", ""))
                .await
                .unwrap();
        }
        channel
            .bind_queue(&BindingSpec::new("q1", "d", "only-q1"))
            .await
            .unwrap();

        broker.publish_raw("f", "anything", b"{}").unwrap();
        assert_eq!(broker.queue_depth("q1"), 1);
        assert_eq!(broker.queue_depth("q2"), 1);

        broker.publish_raw("d", "only-q1", b"{}").unwrap();
        broker.publish_raw("d", "nobody", b"{}").unwrap();
        assert_eq!(broker.queue_depth("q1"), 2);
        assert_eq!(broker.queue_depth("q2"), 1);

        broker.publish_raw("", "q2", b"{}").unwrap();
        assert_eq!(broker.queue_depth("q2"), 2);

        assert!(matches!(
            broker.publish_raw("missing", "x", b"{}"),
            Err(BrokerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_conflicting_redeclare_is_rejected() {
        let broker = InMemoryBroker::new();
        let channel = topology(&broker).await;

        let result = channel
            .declare_exchange(&ExchangeSpec::new("events", ExchangeKind::Fanout, true))
            .await;
        assert!(matches!(result, Err(BrokerError::TopologyConflict { .. })));

        channel
            .declare_exchange(&ExchangeSpec::new("events", ExchangeKind::Topic, true))
            .await
            .expect("identical redeclare is a no-op");
    }

    #[tokio::test]
    async fn test_nack_requeue_marks_redelivered() {
        let broker = InMemoryBroker::new();
        let channel = topology(&broker).await;
        broker.publish_raw("events", "order.generated", b"{\"n\":1}").unwrap();

        let first = channel.get("work").await.unwrap().expect("message");
        assert!(!first.redelivered);
        channel.nack(first.delivery_tag, true).await.unwrap();

        let second = channel.get("work").await.unwrap().expect("requeued");
        assert!(second.redelivered);
        assert_eq!(second.body, first.body);
        channel.ack(second.delivery_tag).await.unwrap();

        assert_eq!(broker.queue_depth("work"), 0);
        assert_eq!(broker.unacked_count(), 0);
        assert!(channel.ack(second.delivery_tag).await.is_err());
    }

    #[tokio::test]
    async fn test_delivery_limit_dead_letters() {
        let broker = InMemoryBroker::with_delivery_limit(2);
        let channel = topology(&broker).await;
        broker.publish_raw("events", "order.generated", b"{}").unwrap();

        let mut deliveries = 0;
        while let Some(delivery) = channel.get("work").await.unwrap() {
            deliveries += 1;
            channel.nack(delivery.delivery_tag, true).await.unwrap();
        }

        assert_eq!(deliveries, 3);
        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DeadLetterReason::DeliveryLimit);
        assert_eq!(dead[0].delivery_count, 3);
    }

    #[tokio::test]
    async fn test_disconnect_requeues_and_ends_streams() {
        let broker = InMemoryBroker::new();
        let channel = topology(&broker).await;
        broker.publish_raw("events", "order.a", b"1").unwrap();

        let mut stream = channel.consume("work", "ctag").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"1");

        broker.disconnect_all();
        assert!(stream.next().await.is_none());
        assert!(!channel.is_connected());
        assert_eq!(broker.queue_depth("work"), 1);
        assert!(matches!(
            channel.ack(delivery.delivery_tag).await,
            Err(BrokerError::Connection { .. })
        ));

        let fresh = broker.connect().await.unwrap();
        let again = fresh.get("work").await.unwrap().expect("requeued message");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_fail_next_connects() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);

        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(broker.open_channels(), 1);
    }

    #[tokio::test]
    async fn test_bind_requires_existing_resources() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        channel.declare_queue(&QueueSpec::new("q", true)).await.unwrap();

        let result = channel
            .bind_queue(&BindingSpec::new("q", "nowhere", "#"))
            .await;
        assert!(matches!(result, Err(BrokerError::NotFound { .. })));
    }
}
