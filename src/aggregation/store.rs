//! # Demand persistence
//!
//! The engine reads and writes pending demand only through [`DemandStore`].
//! [`InMemoryDemandStore`] backs tests and database-less deployments;
//! [`PgDemandStore`] persists to the `requests` table.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::PgPool;

use super::types::{checked_total, DemandRecord, NewDemand};
use crate::error::BrokerResult;

#[async_trait]
pub trait DemandStore: Send + Sync + Debug {
    /// Persist a new pending record and return it with its generated id
    async fn create(&self, demand: &NewDemand) -> BrokerResult<DemandRecord>;

    /// Pending records for a product, oldest first
    async fn pending_for_product(&self, product_id: &str) -> BrokerResult<Vec<DemandRecord>>;

    /// Sum of pending quantities for a product
    async fn pending_total(&self, product_id: &str) -> BrokerResult<i64>;

    /// Delete the given ids, returning how many rows were actually removed
    async fn delete_by_ids(&self, ids: &[i64]) -> BrokerResult<u64>;
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    records: BTreeMap<i64, DemandRecord>,
}

/// Process-local demand store
#[derive(Debug, Default)]
pub struct InMemoryDemandStore {
    state: Mutex<MemoryState>,
}

impl InMemoryDemandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of pending records across all products
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DemandStore for InMemoryDemandStore {
    async fn create(&self, demand: &NewDemand) -> BrokerResult<DemandRecord> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let record = DemandRecord {
            id: state.next_id,
            client_id: demand.client_id.clone(),
            product_id: demand.product_id.clone(),
            quantity: demand.quantity,
            created_at: Utc::now(),
        };
        state.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn pending_for_product(&self, product_id: &str) -> BrokerResult<Vec<DemandRecord>> {
        Ok(self
            .state
            .lock()
            .records
            .values()
            .filter(|r| r.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn pending_total(&self, product_id: &str) -> BrokerResult<i64> {
        checked_total(
            self.state
                .lock()
                .records
                .values()
                .filter(|r| r.product_id == product_id)
                .map(|r| r.quantity),
        )
    }

    async fn delete_by_ids(&self, ids: &[i64]) -> BrokerResult<u64> {
        let mut state = self.state.lock();
        Ok(ids
            .iter()
            .filter(|id| state.records.remove(*id).is_some())
            .count() as u64)
    }
}

/// Postgres-backed demand store over the `requests` table
#[derive(Debug, Clone)]
pub struct PgDemandStore {
    pool: PgPool,
}

impl PgDemandStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DemandStore for PgDemandStore {
    async fn create(&self, demand: &NewDemand) -> BrokerResult<DemandRecord> {
        let record = sqlx::query_as::<_, DemandRecord>(
            r#"
            INSERT INTO requests (client_id, product_id, quantity, created_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING id, client_id, product_id, quantity, created_at
            "#,
        )
        .bind(&demand.client_id)
        .bind(&demand.product_id)
        .bind(demand.quantity)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn pending_for_product(&self, product_id: &str) -> BrokerResult<Vec<DemandRecord>> {
        let records = sqlx::query_as::<_, DemandRecord>(
            r#"
            SELECT id, client_id, product_id, quantity, created_at
            FROM requests
            WHERE product_id = $1
            ORDER BY id
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn pending_total(&self, product_id: &str) -> BrokerResult<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM requests WHERE product_id = $1",
        )
        .bind(product_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    async fn delete_by_ids(&self, ids: &[i64]) -> BrokerResult<u64> {
        let result = sqlx::query("DELETE FROM requests WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_ids_are_unique_and_filtered_by_product() {
        let store = InMemoryDemandStore::new();
        let a = store.create(&NewDemand::new("c1", "P1", 10)).await.unwrap();
        let b = store.create(&NewDemand::new("c2", "P2", 4)).await.unwrap();
        let c = store.create(&NewDemand::new("c3", "P1", 5)).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(b.id, c.id);

        let pending = store.pending_for_product("P1").await.unwrap();
        assert_eq!(pending.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a.id, c.id]);
        assert_eq!(store.pending_total("P1").await.unwrap(), 15);
        assert_eq!(store.pending_total("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_reports_only_removed_rows() {
        let store = InMemoryDemandStore::new();
        let a = store.create(&NewDemand::new("c1", "P1", 10)).await.unwrap();
        assert_eq!(store.delete_by_ids(&[a.id, 999]).await.unwrap(), 1);
        assert_eq!(store.delete_by_ids(&[a.id]).await.unwrap(), 0);
        assert!(store.is_empty());
    }
}
