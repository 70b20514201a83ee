//! Postgres-backed stores; run with DATABASE_URL pointing at a scratch database

use demand_broker::aggregation::{DemandStore, NewDemand, PgDemandStore};
use demand_broker::config::DatabaseConfig;
use demand_broker::database::DatabaseConnection;
use demand_broker::fulfillment::{PgProviderOrderStore, ProviderOrder, ProviderOrderStore};

async fn database() -> DatabaseConnection {
    let config = DatabaseConfig {
        url: std::env::var("DATABASE_URL").ok(),
        ..DatabaseConfig::default()
    };
    let database = DatabaseConnection::from_config(&config)
        .await
        .unwrap()
        .expect("DATABASE_URL must be set");
    database.migrate().await.unwrap();
    database
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_pg_demand_store_round_trip() {
    let database = database().await;
    assert!(database.health_check().await.unwrap());
    let store = PgDemandStore::new(database.pool().clone());
    let product = format!("pg-{}", uuid::Uuid::new_v4());

    let a = store.create(&NewDemand::new("c1", &product, 10)).await.unwrap();
    let b = store.create(&NewDemand::new("c2", &product, 5)).await.unwrap();
    assert_eq!(store.pending_total(&product).await.unwrap(), 15);

    let pending = store.pending_for_product(&product).await.unwrap();
    assert_eq!(pending.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a.id, b.id]);

    assert_eq!(store.delete_by_ids(&[a.id, b.id]).await.unwrap(), 2);
    assert_eq!(store.delete_by_ids(&[a.id]).await.unwrap(), 0);
    assert_eq!(store.pending_total(&product).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_pg_provider_orders_are_idempotent() {
    let database = database().await;
    let store = PgProviderOrderStore::new(database.pool().clone());
    let order_id = uuid::Uuid::new_v4().to_string();

    let order = ProviderOrder::reserved(&order_id, "V-1", Vec::new());
    assert!(store.insert_if_absent(&order).await.unwrap());
    assert!(!store.insert_if_absent(&order).await.unwrap());
    assert_eq!(store.find(&order_id).await.unwrap().unwrap().vendor_id, "V-1");
}
