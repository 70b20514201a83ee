//! # Topology Handlers
//!
//! Declare and list exchanges, queues and bindings.

use std::str::FromStr;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use tracing::debug;

use super::required;
use crate::messaging::{DeclareOutcome, ExchangeKind};
use crate::types::api::{
    BindingInfo, BindingListResponse, CreateBindingRequest, CreateExchangeRequest,
    CreateQueueRequest, ExchangeListResponse, MessageResponse, QueueListResponse,
};
use crate::web::errors::ApiResult;
use crate::web::state::ManagementState;

fn declared_message(resource: &str, name: &str, outcome: DeclareOutcome) -> MessageResponse {
    let message = match outcome {
        DeclareOutcome::Created => format!("{resource} \"{name}\" created"),
        DeclareOutcome::AlreadyDeclared => format!("{resource} \"{name}\" already exists"),
    };
    MessageResponse { message }
}

/// POST /queues
pub async fn create_queue(
    State(state): State<ManagementState>,
    payload: Result<Json<CreateQueueRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    let Json(request) = payload?;
    let name = required(request.queue_name, "queueName")?;
    let durable = request.durable.unwrap_or(true);

    let outcome = state.broker.create_queue(&name, durable).await?;
    Ok((
        StatusCode::CREATED,
        Json(declared_message("Queue", &name, outcome)),
    ))
}

/// POST /exchanges
pub async fn create_exchange(
    State(state): State<ManagementState>,
    payload: Result<Json<CreateExchangeRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    let Json(request) = payload?;
    let name = required(request.exchange_name, "exchangeName")?;
    let kind = match request.exchange_type.as_deref() {
        Some(kind) => ExchangeKind::from_str(kind)?,
        None => ExchangeKind::Topic,
    };
    let durable = request.durable.unwrap_or(true);

    let outcome = state.broker.create_exchange(&name, kind, durable).await?;
    Ok((
        StatusCode::CREATED,
        Json(declared_message("Exchange", &name, outcome)),
    ))
}

/// POST /bindings
pub async fn create_binding(
    State(state): State<ManagementState>,
    payload: Result<Json<CreateBindingRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    let Json(request) = payload?;
    let queue = required(request.queue_name, "queueName")?;
    let exchange = required(request.exchange_name, "exchangeName")?;
    let routing_key = request.routing_key.unwrap_or_default();

    let outcome = state.broker.bind(&queue, &exchange, &routing_key).await?;
    let message = match outcome {
        DeclareOutcome::Created => {
            format!("Queue \"{queue}\" bound to \"{exchange}\" with key \"{routing_key}\"")
        }
        DeclareOutcome::AlreadyDeclared => {
            format!("Queue \"{queue}\" already bound to \"{exchange}\" with key \"{routing_key}\"")
        }
    };
    Ok((StatusCode::CREATED, Json(MessageResponse { message })))
}

/// GET /queues
pub async fn list_queues(State(state): State<ManagementState>) -> Json<QueueListResponse> {
    let queues: Vec<String> = state
        .broker
        .list_queues()
        .into_iter()
        .map(|q| q.name)
        .collect();
    debug!(count = queues.len(), "Listing queues");
    Json(QueueListResponse { queues })
}

/// GET /exchanges
pub async fn list_exchanges(State(state): State<ManagementState>) -> Json<ExchangeListResponse> {
    let exchanges = state
        .broker
        .list_exchanges()
        .into_iter()
        .map(|e| e.name)
        .collect();
    Json(ExchangeListResponse { exchanges })
}

/// GET /bindings
pub async fn list_bindings(State(state): State<ManagementState>) -> Json<BindingListResponse> {
    let bindings = state
        .broker
        .list_bindings()
        .into_iter()
        .map(BindingInfo::from)
        .collect();
    Json(BindingListResponse { bindings })
}
