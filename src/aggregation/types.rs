use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{BrokerError, BrokerResult};
use crate::messaging::MessageId;

/// A pending requested quantity for one product
/// Maps to the `requests` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DemandRecord {
    pub id: i64,
    pub client_id: String,
    pub product_id: String,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
}

/// New DemandRecord for creation (without generated fields)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDemand {
    pub client_id: String,
    pub product_id: String,
    pub quantity: i64,
}

impl NewDemand {
    pub fn new(client_id: impl Into<String>, product_id: impl Into<String>, quantity: i64) -> Self {
        Self {
            client_id: client_id.into(),
            product_id: product_id.into(),
            quantity,
        }
    }

    pub fn validate(&self) -> BrokerResult<()> {
        if self.product_id.trim().is_empty() {
            return Err(BrokerError::validation(
                "product_id",
                "product id must not be empty",
            ));
        }
        if self.quantity <= 0 {
            return Err(BrokerError::validation(
                "quantity",
                format!("quantity must be positive, got {}", self.quantity),
            ));
        }
        Ok(())
    }
}

/// Namespace for deterministic order ids
const ORDER_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_2c4e_8a57_4b3c_9e0f_d25a_71c8_b403);

/// Sum of `quantities`, rejecting totals that do not fit in an `i64`
pub fn checked_total(quantities: impl IntoIterator<Item = i64>) -> BrokerResult<i64> {
    quantities.into_iter().try_fold(0i64, |total, quantity| {
        total.checked_add(quantity).ok_or_else(|| {
            BrokerError::validation("quantity", "pending quantity total overflows i64")
        })
    })
}

/// Consolidated order built from a snapshot of pending records
///
/// Serialized as the `order.generated` event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateOrder {
    pub order_id: Uuid,
    pub product_id: String,
    pub total_quantity: i64,
    pub request_ids: Vec<i64>,
}

impl AggregateOrder {
    /// Order covering exactly `records`
    ///
    /// The order id is a v5 UUID over the product and the sorted record ids, so
    /// republishing the same snapshot yields the same id.
    pub fn from_records(product_id: impl Into<String>, records: &[DemandRecord]) -> BrokerResult<Self> {
        let product_id = product_id.into();
        let request_ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        Ok(Self {
            order_id: Self::order_id_for(&product_id, &request_ids),
            total_quantity: checked_total(records.iter().map(|r| r.quantity))?,
            product_id,
            request_ids,
        })
    }

    pub fn order_id_for(product_id: &str, request_ids: &[i64]) -> Uuid {
        let mut ids = request_ids.to_vec();
        ids.sort_unstable();
        let mut name = Vec::with_capacity(product_id.len() + 1 + ids.len() * 8);
        name.extend_from_slice(product_id.as_bytes());
        name.push(0);
        for id in ids {
            name.extend_from_slice(&id.to_be_bytes());
        }
        Uuid::new_v5(&ORDER_ID_NAMESPACE, &name)
    }
}

/// What happened to the product's pending demand after a submit
#[derive(Debug, Clone, PartialEq)]
pub enum PromotionStatus {
    /// Sum is still below the threshold
    BelowThreshold { pending_total: i64 },
    /// An order was published and its records removed
    Promoted {
        order: AggregateOrder,
        message_id: MessageId,
    },
    /// The order was published but its records could not be deleted yet
    ///
    /// The engine withholds those records from later snapshots and retries the delete
    /// on the product's next evaluation.
    CleanupPending {
        order: AggregateOrder,
        message_id: MessageId,
        error: BrokerError,
    },
    /// Threshold crossed but the order could not be published; records stay pending
    PublishFailed { pending_total: i64, error: String },
    /// The record was stored but the product could not be evaluated
    EvaluationFailed { error: BrokerError },
}

impl PromotionStatus {
    pub fn is_promoted(&self) -> bool {
        matches!(self, Self::Promoted { .. })
    }

    /// The published order, whether or not its records are already gone
    pub fn order(&self) -> Option<&AggregateOrder> {
        match self {
            Self::Promoted { order, .. } | Self::CleanupPending { order, .. } => Some(order),
            _ => None,
        }
    }
}

/// Result of [`AggregationEngine::submit`](super::AggregationEngine::submit)
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub record: DemandRecord,
    pub promotion: PromotionStatus,
}

/// Engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationStats {
    pub submitted: u64,
    pub promotions: u64,
    pub publish_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, quantity: i64) -> DemandRecord {
        DemandRecord {
            id,
            client_id: "c1".to_string(),
            product_id: "P1".to_string(),
            quantity,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_new_demand_validation() {
        assert!(NewDemand::new("c1", "P1", 5).validate().is_ok());
        assert!(matches!(
            NewDemand::new("c1", "  ", 5).validate(),
            Err(BrokerError::Validation { field, .. }) if field == "product_id"
        ));
        assert!(matches!(
            NewDemand::new("c1", "P1", 0).validate(),
            Err(BrokerError::Validation { field, .. }) if field == "quantity"
        ));
        assert!(NewDemand::new("c1", "P1", -3).validate().is_err());
    }

    #[test]
    fn test_order_totals_match_records() {
        let records = vec![record(1, 10), record(2, 15), record(3, 10)];
        let order = AggregateOrder::from_records("P1", &records).unwrap();
        assert_eq!(order.total_quantity, 35);
        assert_eq!(order.request_ids, vec![1, 2, 3]);

        let payload = serde_json::to_value(&order).unwrap();
        assert_eq!(payload["product_id"], "P1");
        assert_eq!(payload["total_quantity"], 35);
        assert_eq!(payload["order_id"], order.order_id.to_string());
    }

    #[test]
    fn test_order_id_depends_only_on_product_and_ids() {
        let first = AggregateOrder::from_records("P1", &[record(1, 10), record(2, 25)]).unwrap();
        let reordered =
            AggregateOrder::from_records("P1", &[record(2, 25), record(1, 10)]).unwrap();
        let wider =
            AggregateOrder::from_records("P1", &[record(1, 10), record(2, 25), record(3, 1)])
                .unwrap();
        let other_product =
            AggregateOrder::from_records("P2", &[record(1, 10), record(2, 25)]).unwrap();

        assert_eq!(first.order_id, reordered.order_id);
        assert_ne!(first.order_id, wider.order_id);
        assert_ne!(first.order_id, other_product.order_id);
    }

    #[test]
    fn test_total_overflow_is_rejected() {
        assert_eq!(checked_total([i64::MAX - 1, 1]).unwrap(), i64::MAX);
        assert!(matches!(
            checked_total([i64::MAX, 1]),
            Err(BrokerError::Validation { field, .. }) if field == "quantity"
        ));
        assert!(AggregateOrder::from_records("P1", &[record(1, i64::MAX), record(2, 1)]).is_err());
    }
}
