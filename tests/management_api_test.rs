//! Management HTTP API driven through the router with `oneshot`

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::memory_broker;
use demand_broker::config::ManagementConfig;
use demand_broker::messaging::providers::InMemoryBroker;
use demand_broker::messaging::transport::BrokerConnector;
use demand_broker::web::{create_app, ManagementState};

fn app(memory: &InMemoryBroker) -> Router {
    create_app(ManagementState::new(
        memory_broker(memory),
        ManagementConfig::default(),
    ))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    send(
        app,
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

#[tokio::test]
async fn test_topology_lifecycle() {
    let memory = InMemoryBroker::new();
    let app = app(&memory);

    let (status, _) = post(&app, "/exchanges", json!({"exchangeName": "order.events"})).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = post(&app, "/queues", json!({"queueName": "provider_orders"})).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = post(
        &app,
        "/bindings",
        json!({
            "queueName": "provider_orders",
            "exchangeName": "order.events",
            "routingKey": "order.generated"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // Idempotent re-declaration
    let (status, body) = post(&app, "/queues", json!({"queueName": "provider_orders"})).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["message"].as_str().unwrap().contains("already exists"));
    assert_eq!(memory.queue_declare_count("provider_orders"), 1);

    let (_, queues) = get(&app, "/queues").await;
    assert_eq!(queues, json!({"queues": ["provider_orders"]}));
    let (_, exchanges) = get(&app, "/exchanges").await;
    assert_eq!(exchanges, json!({"exchanges": ["order.events"]}));
    let (_, bindings) = get(&app, "/bindings").await;
    assert_eq!(
        bindings["bindings"][0],
        json!({
            "queueName": "provider_orders",
            "exchangeName": "order.events",
            "routingKey": "order.generated"
        })
    );
}

#[tokio::test]
async fn test_binding_to_unknown_resources_is_404() {
    let app = app(&InMemoryBroker::new());
    let (status, body) = post(
        &app,
        "/bindings",
        json!({"queueName": "ghost", "exchangeName": "nowhere"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");

    let (status, _) = post(&app, "/bindings", json!({"queueName": "ghost"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_exchange_type_is_400() {
    let app = app(&InMemoryBroker::new());
    let (status, _) = post(
        &app,
        "/exchanges",
        json!({"exchangeName": "x", "type": "priority"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_publish_message_routes_and_preserves_id() {
    let memory = InMemoryBroker::new();
    let app = app(&memory);
    post(&app, "/queues", json!({"queueName": "inbox"})).await;

    let (status, body) = post(
        &app,
        "/messages",
        json!({"routingKey": "inbox", "message": {"message_id": "fixed-id", "n": 1}}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["messageId"], "fixed-id");

    let (status, body) = post(&app, "/messages", json!({"routingKey": "inbox", "message": {"n": 2}})).await;
    assert_eq!(status, StatusCode::CREATED);
    let assigned = body["messageId"].as_str().unwrap().to_string();
    assert!(uuid::Uuid::parse_str(&assigned).is_ok());

    let channel = memory.connect().await.unwrap();
    let first = channel.get("inbox").await.unwrap().unwrap();
    let first: Value = serde_json::from_slice(&first.body).unwrap();
    assert_eq!(first["message_id"], "fixed-id");
    let second = channel.get("inbox").await.unwrap().unwrap();
    let second: Value = serde_json::from_slice(&second.body).unwrap();
    assert_eq!(second["message_id"], assigned.as_str());
    assert!(second["timestamp"].is_string());
}

#[tokio::test]
async fn test_publish_without_message_is_400() {
    let app = app(&InMemoryBroker::new());
    let (status, body) = post(&app, "/messages", json!({"routingKey": "inbox"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("message"));
}

#[tokio::test]
async fn test_broker_outage_is_503() {
    let memory = InMemoryBroker::new();
    memory.fail_next_connects(u32::MAX);
    let app = app(&memory);
    let (status, body) = post(&app, "/queues", json!({"queueName": "q"})).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "SERVICE_UNAVAILABLE");

    let (_, queues) = get(&app, "/queues").await;
    assert_eq!(queues, json!({"queues": []}));
}

#[tokio::test]
async fn test_health_reports_broker_state() {
    let memory = InMemoryBroker::new();
    let app = app(&memory);
    post(&app, "/queues", json!({"queueName": "q"})).await;

    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["broker"]["queues"], 1);
    assert_eq!(body["broker"]["provider"], "in_memory");
}
