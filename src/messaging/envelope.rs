//! # Message Envelope
//!
//! Wire format shared by every publish path:
//!
//! ```json
//! {"message_id": "<uuid>", "producer_id": "...", "timestamp": "<rfc3339>", ...domain fields}
//! ```
//!
//! Payloads that are not JSON objects are wrapped as `{"data": <payload>}` before the
//! metadata is added, so the envelope is always an object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::MessageId;
use crate::error::{BrokerError, BrokerResult};

pub const MESSAGE_ID_FIELD: &str = "message_id";
pub const PRODUCER_ID_FIELD: &str = "producer_id";
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Stamped event ready for transmission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: MessageId,
    pub producer_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl MessageEnvelope {
    /// Stamp a payload with a fresh id, the producer identity and the current time
    pub fn stamp(payload: Value, producer_id: impl Into<String>) -> Self {
        let mut fields = into_object(payload);
        fields.remove(MESSAGE_ID_FIELD);
        fields.remove(PRODUCER_ID_FIELD);
        fields.remove(TIMESTAMP_FIELD);

        Self {
            message_id: MessageId::generate(),
            producer_id: producer_id.into(),
            timestamp: Utc::now(),
            fields,
        }
    }

    pub fn to_value(&self) -> BrokerResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn to_bytes(&self) -> BrokerResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Domain field accessor
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Guarantee a JSON message carries an identity without ever replacing an existing one
///
/// Used by the management publish endpoint: messages stamped by a producer keep their
/// `message_id`; raw messages get one assigned here.
pub fn ensure_message_identity(message: Value) -> (MessageId, Value) {
    let mut fields = into_object(message);
    let existing = fields
        .get(MESSAGE_ID_FIELD)
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .map(MessageId::from);

    let message_id = match existing {
        Some(id) => id,
        None => {
            let id = MessageId::generate();
            fields.insert(MESSAGE_ID_FIELD.to_string(), Value::String(id.to_string()));
            id
        }
    };
    if !fields.contains_key(TIMESTAMP_FIELD) {
        fields.insert(
            TIMESTAMP_FIELD.to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
    }

    (message_id, Value::Object(fields))
}

/// Read the idempotency key out of a decoded body
pub fn message_id_of(body: &Value) -> Option<&str> {
    body.get(MESSAGE_ID_FIELD).and_then(Value::as_str)
}

/// Decode a delivery body into JSON, mapping failures to a decode error for `queue`
pub fn decode_body(queue: &str, body: &[u8]) -> BrokerResult<Value> {
    serde_json::from_slice(body).map_err(|e| BrokerError::decode(queue, e.to_string()))
}

fn into_object(payload: Value) -> Map<String, Value> {
    match payload {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    }
}
