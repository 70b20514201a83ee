//! # Fulfillment
//!
//! Downstream consumer of `order.generated` events: stores a provider order per order id
//! and publishes `stock.reserved`.

pub mod handler;
pub mod store;
pub mod types;

pub use handler::StockReservationHandler;
pub use store::{InMemoryProviderOrderStore, PgProviderOrderStore, ProviderOrderStore};
pub use types::{OrderEvent, OrderItem, ProviderOrder, StockReserved, STATUS_RESERVED};
