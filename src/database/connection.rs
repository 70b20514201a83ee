use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use super::MIGRATOR;
use crate::config::DatabaseConfig;
use crate::error::{BrokerError, BrokerResult};

/// Pooled Postgres connection
#[derive(Debug, Clone)]
pub struct DatabaseConnection {
    pool: PgPool,
}

impl DatabaseConnection {
    /// Connect using `database.url`; `Ok(None)` when no URL is configured
    pub async fn from_config(config: &DatabaseConfig) -> BrokerResult<Option<Self>> {
        let Some(url) = config.url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;
        info!(max_connections = config.max_connections, "Database pool established");
        Ok(Some(Self { pool }))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> BrokerResult<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| BrokerError::persistence("migrate", e.to_string()))
    }

    pub async fn health_check(&self) -> BrokerResult<bool> {
        let row = sqlx::query("SELECT 1 as health")
            .fetch_one(&self.pool)
            .await?;

        let health: i32 = row.get("health");
        Ok(health == 1)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_url_yields_none() {
        let config = DatabaseConfig::default();
        assert!(DatabaseConnection::from_config(&config).await.unwrap().is_none());
    }
}
