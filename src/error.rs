//! # Broker Error Types
//!
//! Structured error handling for the messaging layer and the aggregation engine using
//! thiserror, with constructor helpers so call sites stay short.
//!
//! Propagation policy:
//! - [`BrokerError::Connection`] is recovered locally by reconnecting and is never fatal.
//! - [`BrokerError::Decode`] and [`BrokerError::Handler`] are decided per message and never
//!   terminate a receive loop.
//! - [`BrokerError::Publish`] is always surfaced to the caller of `publish`.
//! - [`BrokerError::PromotionRace`] indicates a missing lock and is a defect, not a
//!   normal runtime condition.

use thiserror::Error;

/// Comprehensive broker error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Topology conflict for {resource} '{name}': {message}")]
    TopologyConflict {
        resource: String,
        name: String,
        message: String,
    },

    #[error("{resource} not found: {name}")]
    NotFound { resource: String, name: String },

    #[error("Publish failed for exchange '{exchange}' with routing key '{routing_key}': {}", attempts.join("; "))]
    Publish {
        exchange: String,
        routing_key: String,
        attempts: Vec<String>,
    },

    #[error("Message decode error on queue '{queue}': {message}")]
    Decode { queue: String, message: String },

    #[error("Message handler failed: {message}")]
    Handler { message: String },

    #[error("Promotion race detected for product '{product_id}': {message}")]
    PromotionRace { product_id: String, message: String },

    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Persistence error: {operation}: {message}")]
    Persistence { operation: String, message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Channel operation failed: {operation}: {message}")]
    Channel { operation: String, message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Operation cancelled by shutdown")]
    Shutdown,
}

impl BrokerError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a topology conflict error
    pub fn topology_conflict(
        resource: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::TopologyConflict {
            resource: resource.into(),
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(resource: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            name: name.into(),
        }
    }

    /// Create a publish error from every attempted strategy's failure reason
    pub fn publish(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        attempts: Vec<String>,
    ) -> Self {
        Self::Publish {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            attempts,
        }
    }

    /// Create a decode error
    pub fn decode(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            queue: queue.into(),
            message: message.into(),
        }
    }

    /// Create a handler error
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Create a promotion race error
    pub fn promotion_race(product_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PromotionRace {
            product_id: product_id.into(),
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Persistence {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a channel operation error
    pub fn channel(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Channel {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether the error means the broker connection is gone and a reconnect is needed
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::serialization(err.to_string())
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => BrokerError::persistence("query", "No rows found"),
            sqlx::Error::Database(db_err) => BrokerError::persistence("database", db_err.to_string()),
            sqlx::Error::PoolTimedOut => BrokerError::persistence("pool", "Pool timed out"),
            sqlx::Error::PoolClosed => BrokerError::persistence("pool", "Database pool is closed"),
            other => BrokerError::persistence("database", other.to_string()),
        }
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::IOError(_) => BrokerError::connection(err.to_string()),
            lapin::Error::ProtocolError(ref amqp) => {
                let text = amqp.get_message().as_str().to_string();
                if text.contains("PRECONDITION_FAILED") {
                    BrokerError::topology_conflict("resource", "unknown", text)
                } else if text.contains("NOT_FOUND") {
                    BrokerError::not_found("resource", text)
                } else {
                    BrokerError::channel("amqp", text)
                }
            }
            other => BrokerError::channel("amqp", other.to_string()),
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            BrokerError::connection(format!("management API unreachable: {err}"))
        } else if err.is_decode() {
            BrokerError::serialization(err.to_string())
        } else {
            BrokerError::channel("http", err.to_string())
        }
    }
}

/// Result type alias for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_creation() {
        let conn = BrokerError::connection("socket closed");
        assert!(conn.is_connection_error());

        let conflict = BrokerError::topology_conflict("exchange", "orders", "kind mismatch");
        assert!(matches!(conflict, BrokerError::TopologyConflict { .. }));
        assert!(!conflict.is_connection_error());
    }

    #[test]
    fn test_publish_error_lists_every_attempt() {
        let err = BrokerError::publish(
            "order.events",
            "order.generated",
            vec![
                "management_api: status 503".to_string(),
                "direct: connection refused".to_string(),
            ],
        );
        let display = err.to_string();
        assert!(display.contains("order.events"));
        assert!(display.contains("management_api: status 503"));
        assert!(display.contains("direct: connection refused"));
    }

    #[test]
    fn test_serde_json_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{broken").unwrap_err();
        let err: BrokerError = json_err.into();
        assert!(matches!(err, BrokerError::Serialization { .. }));
    }
}
