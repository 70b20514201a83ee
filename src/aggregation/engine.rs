//! # Aggregation Engine
//!
//! Per-product threshold state machine. Every submit persists a record, then re-evaluates
//! the product's pending sum under that product's async mutex. Crossing the threshold
//! publishes one `AggregateOrder` covering exactly the snapshotted records and deletes
//! them. Different products never share a lock.
//!
//! Records of a published order whose delete keeps failing are withheld from every later
//! snapshot until a retried delete succeeds, so no record id appears in two orders.
//!
//! The lock is process-local: two engine instances over one Postgres store can both
//! promote the same records.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::store::DemandStore;
use super::types::{
    checked_total, AggregateOrder, AggregationStats, DemandRecord, NewDemand, PromotionStatus,
    SubmitOutcome,
};
use crate::config::AggregationConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::logging::log_error;
use crate::messaging::{MessageId, Producer};

/// Delete attempts for a published order before its records are withheld
const DELETE_ATTEMPTS: u32 = 3;
const DELETE_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Sink for generated orders
#[async_trait]
pub trait OrderPublisher: Send + Sync + Debug {
    async fn publish_order(
        &self,
        order: &AggregateOrder,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<MessageId>;
}

#[async_trait]
impl OrderPublisher for Producer {
    async fn publish_order(
        &self,
        order: &AggregateOrder,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<MessageId> {
        let payload = serde_json::to_value(order)?;
        self.publish_default(payload, exchange, routing_key).await
    }
}

#[derive(Debug, Default)]
struct EngineCounters {
    submitted: AtomicU64,
    promotions: AtomicU64,
    publish_failures: AtomicU64,
}

#[derive(Debug)]
pub struct AggregationEngine {
    store: Arc<dyn DemandStore>,
    publisher: Arc<dyn OrderPublisher>,
    threshold: i64,
    order_exchange: String,
    order_routing_key: String,
    product_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Published record ids per product whose delete has not succeeded yet
    unsettled: DashMap<String, Vec<i64>>,
    counters: EngineCounters,
}

impl AggregationEngine {
    pub fn new(
        store: Arc<dyn DemandStore>,
        publisher: Arc<dyn OrderPublisher>,
        config: &AggregationConfig,
    ) -> BrokerResult<Self> {
        if config.min_threshold <= 0 {
            return Err(BrokerError::validation(
                "min_threshold",
                "threshold must be positive",
            ));
        }
        Ok(Self {
            store,
            publisher,
            threshold: config.min_threshold,
            order_exchange: config.order_exchange.clone(),
            order_routing_key: config.order_routing_key.clone(),
            product_locks: DashMap::new(),
            unsettled: DashMap::new(),
            counters: EngineCounters::default(),
        })
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    /// Record new demand and promote the product if its pending sum reaches the threshold
    ///
    /// Fails only when the demand is invalid or cannot be stored. Once the record exists
    /// it is always returned, and evaluation problems are reported in the promotion status.
    pub async fn submit(&self, demand: NewDemand) -> BrokerResult<SubmitOutcome> {
        demand.validate()?;

        // Persisting happens outside the product lock
        let record = self.store.create(&demand).await?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(
            record_id = record.id,
            product_id = %record.product_id,
            quantity = record.quantity,
            "Demand recorded"
        );

        let promotion = match self.evaluate(&record.product_id).await {
            Ok(promotion) => promotion,
            Err(error) => {
                warn!(
                    record_id = record.id,
                    product_id = %record.product_id,
                    error = %error,
                    "Demand recorded but product evaluation failed"
                );
                PromotionStatus::EvaluationFailed { error }
            }
        };
        Ok(SubmitOutcome { record, promotion })
    }

    /// Re-check a product without adding demand, e.g. to retry a failed publish
    pub async fn evaluate(&self, product_id: &str) -> BrokerResult<PromotionStatus> {
        let lock = self.product_lock(product_id);
        let _guard = lock.lock().await;

        self.retry_unsettled(product_id).await;

        let pending = self.eligible_records(product_id).await?;
        let pending_total = checked_total(pending.iter().map(|r| r.quantity))?;
        if pending_total < self.threshold {
            return Ok(PromotionStatus::BelowThreshold { pending_total });
        }

        self.promote(product_id, &pending, pending_total).await
    }

    async fn promote(
        &self,
        product_id: &str,
        pending: &[DemandRecord],
        pending_total: i64,
    ) -> BrokerResult<PromotionStatus> {
        let order = AggregateOrder::from_records(product_id, pending)?;

        let message_id = match self
            .publisher
            .publish_order(&order, &self.order_exchange, &self.order_routing_key)
            .await
        {
            Ok(message_id) => message_id,
            Err(e) => {
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    product_id = %product_id,
                    pending_total = pending_total,
                    error = %e,
                    "Order publish failed; demand stays pending"
                );
                return Ok(PromotionStatus::PublishFailed {
                    pending_total,
                    error: e.to_string(),
                });
            }
        };
        self.counters.promotions.fetch_add(1, Ordering::Relaxed);

        let expected = order.request_ids.len() as u64;
        let deleted = match self.delete_published(&order).await {
            Ok(deleted) => deleted,
            Err(error) => {
                self.unsettled
                    .entry(product_id.to_string())
                    .or_default()
                    .extend(order.request_ids.iter().copied());
                log_error(
                    "aggregation",
                    "promote",
                    &format!(
                        "order {} published but its records could not be deleted: {error}",
                        order.order_id
                    ),
                    Some(product_id),
                );
                return Ok(PromotionStatus::CleanupPending {
                    order,
                    message_id,
                    error,
                });
            }
        };
        if deleted != expected {
            let message = format!(
                "order {} published but only {deleted} of {expected} records were deleted",
                order.order_id
            );
            log_error("aggregation", "promote", &message, Some(product_id));
            return Err(BrokerError::promotion_race(product_id, message));
        }

        info!(
            order_id = %order.order_id,
            product_id = %product_id,
            total_quantity = order.total_quantity,
            records = expected,
            message_id = %message_id,
            "Order generated"
        );

        Ok(PromotionStatus::Promoted { order, message_id })
    }

    /// Delete an order's records, retrying transient store failures under the product lock
    async fn delete_published(&self, order: &AggregateOrder) -> BrokerResult<u64> {
        let mut attempt = 1;
        loop {
            match self.store.delete_by_ids(&order.request_ids).await {
                Ok(deleted) => return Ok(deleted),
                Err(e) if attempt < DELETE_ATTEMPTS => {
                    warn!(
                        order_id = %order.order_id,
                        attempt = attempt,
                        error = %e,
                        "Deleting promoted records failed, retrying"
                    );
                    tokio::time::sleep(DELETE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Retry the delete of records that already went out in an order
    async fn retry_unsettled(&self, product_id: &str) {
        let Some(ids) = self.unsettled.get(product_id).map(|ids| ids.value().clone()) else {
            return;
        };
        match self.store.delete_by_ids(&ids).await {
            Ok(deleted) => {
                self.unsettled.remove(product_id);
                info!(
                    product_id = %product_id,
                    records = ids.len(),
                    deleted = deleted,
                    "Records of an earlier order removed"
                );
            }
            Err(e) => {
                warn!(
                    product_id = %product_id,
                    records = ids.len(),
                    error = %e,
                    "Records of an earlier order are still pending deletion"
                );
            }
        }
    }

    /// Pending records that have not already been published
    async fn eligible_records(&self, product_id: &str) -> BrokerResult<Vec<DemandRecord>> {
        let pending = self.store.pending_for_product(product_id).await?;
        let withheld: HashSet<i64> = match self.unsettled.get(product_id) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Ok(pending),
        };
        Ok(pending
            .into_iter()
            .filter(|r| !withheld.contains(&r.id))
            .collect())
    }

    /// Pending quantity that can still go into an order
    pub async fn pending_total(&self, product_id: &str) -> BrokerResult<i64> {
        let pending = self.eligible_records(product_id).await?;
        checked_total(pending.iter().map(|r| r.quantity))
    }

    pub async fn pending_records(&self, product_id: &str) -> BrokerResult<Vec<DemandRecord>> {
        self.eligible_records(product_id).await
    }

    pub fn stats(&self) -> AggregationStats {
        AggregationStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
        }
    }

    fn product_lock(&self, product_id: &str) -> Arc<Mutex<()>> {
        self.product_locks
            .entry(product_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
