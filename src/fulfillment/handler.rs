//! # Stock reservation handler
//!
//! Turns `order.generated` events into stored provider orders and `stock.reserved`
//! events. The event is published before the order row is written, so a failed publish
//! leaves nothing stored and the redelivered order is processed again. Orders already
//! stored are acknowledged without publishing.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info};

use super::store::ProviderOrderStore;
use super::types::{OrderEvent, ProviderOrder, StockReserved};
use crate::config::FulfillmentConfig;
use crate::messaging::{ConsumedMessage, MessageHandler, Producer};

#[derive(Debug)]
pub struct StockReservationHandler {
    store: Arc<dyn ProviderOrderStore>,
    producer: Arc<Producer>,
    config: FulfillmentConfig,
}

impl StockReservationHandler {
    pub fn new(
        store: Arc<dyn ProviderOrderStore>,
        producer: Arc<Producer>,
        config: FulfillmentConfig,
    ) -> Self {
        Self {
            store,
            producer,
            config,
        }
    }

    /// Reserve stock for one order; `None` when the order was already reserved
    pub async fn reserve(&self, event: &OrderEvent) -> anyhow::Result<Option<ProviderOrder>> {
        if self.store.find(&event.order_id).await?.is_some() {
            debug!(order_id = %event.order_id, "Order already reserved, skipping");
            return Ok(None);
        }

        let items = event.resolved_items();
        if items.is_empty() {
            anyhow::bail!("order {} has no items to reserve", event.order_id);
        }

        let vendor_id = event.assign_vendor(&self.config.default_supplier_id);
        let order = ProviderOrder::reserved(&event.order_id, vendor_id, items);

        let payload = serde_json::to_value(StockReserved::from(&order))?;
        let message_id = self
            .producer
            .publish_default(payload, &self.config.exchange, &self.config.routing_key)
            .await
            .with_context(|| format!("publishing stock reservation for {}", order.order_id))?;

        if !self.store.insert_if_absent(&order).await? {
            debug!(order_id = %order.order_id, "Order stored concurrently");
            return Ok(None);
        }

        info!(
            order_id = %order.order_id,
            vendor_id = %order.vendor_id,
            items = order.items.len(),
            message_id = %message_id,
            "Stock reserved"
        );
        Ok(Some(order))
    }
}

#[async_trait]
impl MessageHandler for StockReservationHandler {
    async fn handle(&self, message: ConsumedMessage) -> anyhow::Result<()> {
        let event: OrderEvent = message.decode()?;
        self.reserve(&event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fulfillment::store::InMemoryProviderOrderStore;
    use crate::messaging::providers::InMemoryBroker;
    use crate::messaging::transport::BrokerConnector;
    use crate::messaging::{Broker, ExchangeKind};
    use serde_json::{json, Value};
    use std::time::Duration;

    async fn setup() -> (InMemoryBroker, Arc<InMemoryProviderOrderStore>, StockReservationHandler) {
        let memory = InMemoryBroker::new();
        let broker = Arc::new(Broker::new(Arc::new(memory.clone()), Duration::from_millis(10)));
        broker
            .create_exchange("provider.events", ExchangeKind::Topic, true)
            .await
            .unwrap();
        broker.create_queue("reserved", true).await.unwrap();
        broker
            .bind("reserved", "provider.events", "stock.reserved")
            .await
            .unwrap();

        let producer = Arc::new(Producer::new("provider-service", broker, None, false));
        let store = Arc::new(InMemoryProviderOrderStore::new());
        let handler = StockReservationHandler::new(
            Arc::clone(&store) as Arc<dyn ProviderOrderStore>,
            producer,
            FulfillmentConfig::default(),
        );
        (memory, store, handler)
    }

    fn message(body: Value) -> ConsumedMessage {
        ConsumedMessage {
            queue: "provider_orders".to_string(),
            exchange: "order.events".to_string(),
            routing_key: "order.generated".to_string(),
            message_id: None,
            redelivered: false,
            body,
        }
    }

    #[tokio::test]
    async fn test_order_reserved_and_event_published() {
        let (memory, store, handler) = setup().await;
        handler
            .handle(message(json!({
                "order_id": "o-1",
                "product_id": "P1",
                "total_quantity": 35,
                "request_ids": [1, 2, 3]
            })))
            .await
            .unwrap();

        let stored = store.find("o-1").await.unwrap().unwrap();
        assert_eq!(stored.vendor_id, "default-supplier");
        assert_eq!(stored.items[0].quantity, 35);

        let channel = memory.connect().await.unwrap();
        let delivery = channel.get("reserved").await.unwrap().unwrap();
        let body: Value = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(body["order_id"], "o-1");
        assert_eq!(body["reserved_items"][0]["product_id"], "P1");
        assert!(body["message_id"].is_string());
    }

    #[tokio::test]
    async fn test_duplicate_order_not_republished() {
        let (memory, store, handler) = setup().await;
        let body = json!({
            "order_id": "o-2",
            "items": [{"product_id": "P1", "quantity": 3, "supplier_id": "S-1"}]
        });
        handler.handle(message(body.clone())).await.unwrap();
        handler.handle(message(body)).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(memory.queue_depth("reserved"), 1);
    }

    #[tokio::test]
    async fn test_order_without_items_is_an_error() {
        let (_memory, store, handler) = setup().await;
        let result = handler.handle(message(json!({"order_id": "o-3"}))).await;
        assert!(result.is_err());
        assert!(store.is_empty());
    }
}
