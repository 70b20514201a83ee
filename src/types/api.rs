//! # Management API Types
//!
//! Request and response bodies of the management HTTP service. Field names are camelCase
//! on the wire. Request fields are optional at the type level so a missing required field
//! surfaces as a 400 validation error instead of a deserialization rejection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messaging::broker::BrokerHealth;
use crate::messaging::types::BindingSpec;

/// `POST /queues`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQueueRequest {
    pub queue_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable: Option<bool>,
}

/// `POST /exchanges`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExchangeRequest {
    pub exchange_name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub exchange_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable: Option<bool>,
}

/// `POST /bindings`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBindingRequest {
    pub queue_name: Option<String>,
    pub exchange_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
}

/// `POST /messages`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishMessageRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
    pub message: Option<Value>,
}

/// Acknowledgement body of the create endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageResponse {
    pub message: String,
}

/// Body of a successful `POST /messages`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublishMessageResponse {
    pub message_id: String,
    pub message: String,
}

/// `GET /queues`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueListResponse {
    pub queues: Vec<String>,
}

/// `GET /exchanges`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeListResponse {
    pub exchanges: Vec<String>,
}

/// One binding in `GET /bindings`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BindingInfo {
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
}

impl From<BindingSpec> for BindingInfo {
    fn from(binding: BindingSpec) -> Self {
        Self {
            queue_name: binding.queue,
            exchange_name: binding.exchange,
            routing_key: binding.routing_key,
        }
    }
}

/// `GET /bindings`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BindingListResponse {
    pub bindings: Vec<BindingInfo>,
}

/// `GET /health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub broker: BrokerHealth,
}

/// Body of every error response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
