//! # Messaging Types
//!
//! Core value types shared by the topology store, the transports, the producer and
//! the consumer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Unique identifier stamped on every published event
///
/// Always a UUID v4 string; consumers use it as the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a fresh id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// AMQP exchange type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            "headers" => Ok(Self::Headers),
            other => Err(BrokerError::validation(
                "type",
                format!("unknown exchange type '{other}' (expected direct, fanout, topic or headers)"),
            )),
        }
    }
}

/// Declared exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind, durable: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            durable,
        }
    }
}

/// Declared queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub created_at: DateTime<Utc>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, durable: bool) -> Self {
        Self {
            name: name.into(),
            durable,
            created_at: Utc::now(),
        }
    }
}

/// Declared binding between a queue and an exchange
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl BindingSpec {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// AMQP basic properties attached on publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch
    pub timestamp: Option<u64>,
    pub content_type: String,
    /// Delivery mode 2 when true
    pub persistent: bool,
}

impl PublishProperties {
    /// Persistent JSON message carrying the envelope's identity
    pub fn persistent_json(message_id: &MessageId, timestamp: DateTime<Utc>) -> Self {
        Self {
            message_id: Some(message_id.to_string()),
            timestamp: u64::try_from(timestamp.timestamp()).ok(),
            content_type: "application/json".to_string(),
            persistent: true,
        }
    }
}

impl Default for PublishProperties {
    fn default() -> Self {
        Self {
            message_id: None,
            timestamp: None,
            content_type: "application/json".to_string(),
            persistent: true,
        }
    }
}

/// A message handed to a consumer by the broker
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used for ack/nack
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    /// True when the broker delivered this message before
    pub redelivered: bool,
    pub properties: PublishProperties,
    pub body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kind_parsing() {
        assert_eq!("topic".parse::<ExchangeKind>().unwrap(), ExchangeKind::Topic);
        assert_eq!("FANOUT".parse::<ExchangeKind>().unwrap(), ExchangeKind::Fanout);
        assert!("x-delayed".parse::<ExchangeKind>().is_err());
        assert_eq!(ExchangeKind::default(), ExchangeKind::Topic);
    }

    #[test]
    fn test_message_id_generation_is_unique() {
        let a = MessageId::generate();
        let b = MessageId::generate();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_persistent_json_properties() {
        let id = MessageId::generate();
        let now = Utc::now();
        let props = PublishProperties::persistent_json(&id, now);
        assert!(props.persistent);
        assert_eq!(props.message_id.as_deref(), Some(id.as_str()));
        assert_eq!(props.content_type, "application/json");
        assert_eq!(props.timestamp, Some(now.timestamp() as u64));
    }
}
