//! # Management API Client
//!
//! HTTP client for the broker management service, used by the producer's management-API
//! publish strategy and by tools that manage topology remotely.

use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::types::{ExchangeKind, MessageId};
use crate::config::ManagementConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::types::api::{
    BindingListResponse, CreateBindingRequest, CreateExchangeRequest, CreateQueueRequest,
    ErrorResponse, ExchangeListResponse, MessageResponse, PublishMessageRequest,
    PublishMessageResponse, QueueListResponse,
};

/// Client for the management HTTP service
#[derive(Debug, Clone)]
pub struct ManagementClient {
    client: Client,
    base_url: Url,
}

impl ManagementClient {
    pub fn new(config: &ManagementConfig) -> BrokerResult<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            BrokerError::configuration("management", format!("Invalid base URL: {e}"))
        })?;

        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(format!("demand-broker/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                BrokerError::configuration("management", format!("Failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> BrokerResult<Url> {
        self.base_url.join(path).map_err(|e| {
            BrokerError::configuration("management", format!("Failed to construct URL: {e}"))
        })
    }

    /// POST /exchanges
    pub async fn create_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerResult<MessageResponse> {
        let request = CreateExchangeRequest {
            exchange_name: Some(name.to_string()),
            exchange_type: Some(kind.to_string()),
            durable: Some(durable),
        };
        self.post("/exchanges", &request).await
    }

    /// POST /queues
    pub async fn create_queue(&self, name: &str, durable: bool) -> BrokerResult<MessageResponse> {
        let request = CreateQueueRequest {
            queue_name: Some(name.to_string()),
            durable: Some(durable),
        };
        self.post("/queues", &request).await
    }

    /// POST /bindings
    pub async fn create_binding(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<MessageResponse> {
        let request = CreateBindingRequest {
            queue_name: Some(queue.to_string()),
            exchange_name: Some(exchange.to_string()),
            routing_key: Some(routing_key.to_string()),
        };
        self.post("/bindings", &request).await
    }

    /// POST /messages
    pub async fn publish_message(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Value,
    ) -> BrokerResult<MessageId> {
        let request = PublishMessageRequest {
            exchange_name: Some(exchange.to_string()),
            routing_key: Some(routing_key.to_string()),
            message: Some(message),
        };
        let response: PublishMessageResponse = self.post("/messages", &request).await?;
        Ok(MessageId::from(response.message_id))
    }

    /// GET /queues
    pub async fn list_queues(&self) -> BrokerResult<Vec<String>> {
        let response: QueueListResponse = self.get("/queues").await?;
        Ok(response.queues)
    }

    /// GET /exchanges
    pub async fn list_exchanges(&self) -> BrokerResult<Vec<String>> {
        let response: ExchangeListResponse = self.get("/exchanges").await?;
        Ok(response.exchanges)
    }

    /// GET /bindings
    pub async fn list_bindings(&self) -> BrokerResult<BindingListResponse> {
        self.get("/bindings").await
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> BrokerResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path)?;
        debug!(url = %url, "Management API request");
        let response = self.client.post(url).json(body).send().await?;
        Self::handle_response(response, path).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> BrokerResult<T> {
        let url = self.url(path)?;
        let response = self.client.get(url).send().await?;
        Self::handle_response(response, path).await
    }

    /// Map non-2xx responses back onto broker error kinds
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
        path: &str,
    ) -> BrokerResult<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|e| e.message)
            .unwrap_or(text);
        let detail = format!("HTTP {status} from {path}: {message}");

        Err(match status {
            StatusCode::BAD_REQUEST => BrokerError::validation(path, detail),
            StatusCode::CONFLICT => BrokerError::topology_conflict("resource", path, detail),
            StatusCode::NOT_FOUND => BrokerError::not_found("resource", detail),
            StatusCode::SERVICE_UNAVAILABLE => BrokerError::connection(detail),
            _ => BrokerError::channel("http", detail),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_base_url_rejected() {
        let config = ManagementConfig {
            base_url: "not a url".to_string(),
            ..ManagementConfig::default()
        };
        assert!(matches!(
            ManagementClient::new(&config),
            Err(BrokerError::Configuration { .. })
        ));
    }

    #[test]
    fn test_url_joining() {
        let client = ManagementClient::new(&ManagementConfig::default()).unwrap();
        assert_eq!(
            client.url("/messages").unwrap().as_str(),
            "http://localhost:5000/messages"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        let config = ManagementConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            request_timeout_ms: 500,
            ..ManagementConfig::default()
        };
        let client = ManagementClient::new(&config).unwrap();
        let result = client.list_queues().await;
        assert!(matches!(result, Err(BrokerError::Connection { .. })));
    }
}
