//! # Fulfillment Worker
//!
//! Consumes `order.generated` events from the `provider_orders` queue, stores a provider
//! order for each and publishes `stock.reserved`.
//!
//! Provider orders go to Postgres when `database.url` is set, otherwise to memory.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info};

use demand_broker::config::ConfigManager;
use demand_broker::database::DatabaseConnection;
use demand_broker::fulfillment::{
    InMemoryProviderOrderStore, PgProviderOrderStore, ProviderOrderStore,
    StockReservationHandler,
};
use demand_broker::logging;
use demand_broker::messaging::{Broker, Consumer, Producer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_structured_logging();

    let config_manager = ConfigManager::load().context("loading configuration")?;
    let config = config_manager.config();

    let store: Arc<dyn ProviderOrderStore> =
        match DatabaseConnection::from_config(&config.database).await? {
            Some(database) => {
                database.migrate().await?;
                Arc::new(PgProviderOrderStore::new(database.pool().clone()))
            }
            None => {
                info!("No database configured; provider orders are kept in memory");
                Arc::new(InMemoryProviderOrderStore::new())
            }
        };

    let broker = Arc::new(Broker::from_config(config));
    let producer = Arc::new(Producer::from_config(config, Arc::clone(&broker))?);
    let handler = Arc::new(StockReservationHandler::new(
        store,
        producer,
        config.fulfillment.clone(),
    ));

    let consumer = Consumer::from_config(config, Arc::clone(&broker));
    consumer
        .subscribe(
            &config.fulfillment.queue,
            &config.aggregation.order_exchange,
            &config.aggregation.order_routing_key,
            handler,
        )
        .await?;
    consumer.start().await.context("starting consumer")?;

    info!(
        queue = %config.fulfillment.queue,
        exchange = %config.aggregation.order_exchange,
        routing_key = %config.aggregation.order_routing_key,
        "Fulfillment worker running"
    );

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }

    info!("Stopping consumer");
    consumer.stop().await?;
    broker.shutdown().await?;
    info!(stats = ?consumer.stats(), "Fulfillment worker stopped");

    Ok(())
}
