use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reservation status recorded for newly stored provider orders
pub const STATUS_RESERVED: &str = "reserved";

/// One line of an order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: String,
    pub quantity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier_id: Option<String>,
}

/// Incoming order event
///
/// Accepts both itemized orders and the aggregate shape
/// (`product_id` + `total_quantity`) emitted by the aggregation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: String,
    #[serde(default)]
    pub vendor_id: Option<String>,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub total_quantity: Option<i64>,
}

impl OrderEvent {
    /// Items to reserve; an aggregate order becomes a single item
    pub fn resolved_items(&self) -> Vec<OrderItem> {
        if !self.items.is_empty() {
            return self.items.clone();
        }
        match (&self.product_id, self.total_quantity) {
            (Some(product_id), Some(quantity)) => vec![OrderItem {
                product_id: product_id.clone(),
                quantity,
                supplier_id: None,
            }],
            _ => Vec::new(),
        }
    }

    /// Explicit vendor, else the first item's supplier, else `default_supplier`
    pub fn assign_vendor(&self, default_supplier: &str) -> String {
        self.vendor_id
            .clone()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.items.first().and_then(|item| item.supplier_id.clone()))
            .unwrap_or_else(|| default_supplier.to_string())
    }
}

/// Stored reservation, one per order id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOrder {
    pub order_id: String,
    pub vendor_id: String,
    pub items: Vec<OrderItem>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl ProviderOrder {
    pub fn reserved(order_id: impl Into<String>, vendor_id: impl Into<String>, items: Vec<OrderItem>) -> Self {
        Self {
            order_id: order_id.into(),
            vendor_id: vendor_id.into(),
            items,
            status: STATUS_RESERVED.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// `stock.reserved` event payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReserved {
    pub order_id: String,
    pub vendor_id: String,
    pub reserved_items: Vec<OrderItem>,
}

impl From<&ProviderOrder> for StockReserved {
    fn from(order: &ProviderOrder) -> Self {
        Self {
            order_id: order.order_id.clone(),
            vendor_id: order.vendor_id.clone(),
            reserved_items: order.items.clone(),
        }
    }
}
