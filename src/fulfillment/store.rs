//! Provider order persistence, idempotent on `order_id`.

use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::PgPool;

use super::types::ProviderOrder;
use crate::error::BrokerResult;

#[async_trait]
pub trait ProviderOrderStore: Send + Sync + Debug {
    /// Store the order unless one with the same id exists; `true` when newly inserted
    async fn insert_if_absent(&self, order: &ProviderOrder) -> BrokerResult<bool>;

    async fn find(&self, order_id: &str) -> BrokerResult<Option<ProviderOrder>>;
}

#[derive(Debug, Default)]
pub struct InMemoryProviderOrderStore {
    orders: Mutex<HashMap<String, ProviderOrder>>,
}

impl InMemoryProviderOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProviderOrderStore for InMemoryProviderOrderStore {
    async fn insert_if_absent(&self, order: &ProviderOrder) -> BrokerResult<bool> {
        let mut orders = self.orders.lock();
        if orders.contains_key(&order.order_id) {
            return Ok(false);
        }
        orders.insert(order.order_id.clone(), order.clone());
        Ok(true)
    }

    async fn find(&self, order_id: &str) -> BrokerResult<Option<ProviderOrder>> {
        Ok(self.orders.lock().get(order_id).cloned())
    }
}

/// Postgres-backed store over the `provider_orders` table
#[derive(Debug, Clone)]
pub struct PgProviderOrderStore {
    pool: PgPool,
}

impl PgProviderOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ProviderOrderRow {
    order_id: String,
    vendor_id: String,
    items: serde_json::Value,
    status: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<ProviderOrderRow> for ProviderOrder {
    type Error = serde_json::Error;

    fn try_from(row: ProviderOrderRow) -> Result<Self, Self::Error> {
        Ok(Self {
            order_id: row.order_id,
            vendor_id: row.vendor_id,
            items: serde_json::from_value(row.items)?,
            status: row.status,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl ProviderOrderStore for PgProviderOrderStore {
    async fn insert_if_absent(&self, order: &ProviderOrder) -> BrokerResult<bool> {
        let items = serde_json::to_value(&order.items)?;
        let result = sqlx::query(
            r#"
            INSERT INTO provider_orders (order_id, vendor_id, items, status, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(&order.order_id)
        .bind(&order.vendor_id)
        .bind(items)
        .bind(&order.status)
        .bind(order.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find(&self, order_id: &str) -> BrokerResult<Option<ProviderOrder>> {
        let row = sqlx::query_as::<_, ProviderOrderRow>(
            r#"
            SELECT order_id, vendor_id, items, status, created_at
            FROM provider_orders
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ProviderOrder::try_from).transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_is_idempotent_on_order_id() {
        let store = InMemoryProviderOrderStore::new();
        let order = ProviderOrder::reserved("o-1", "V-1", Vec::new());
        assert!(store.insert_if_absent(&order).await.unwrap());

        let duplicate = ProviderOrder::reserved("o-1", "V-2", Vec::new());
        assert!(!store.insert_if_absent(&duplicate).await.unwrap());
        assert_eq!(store.len(), 1);
        assert_eq!(store.find("o-1").await.unwrap().unwrap().vendor_id, "V-1");
        assert!(store.find("o-2").await.unwrap().is_none());
    }
}
