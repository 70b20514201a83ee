use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::types::api::{PublishMessageRequest, PublishMessageResponse};
use crate::web::errors::{ApiError, ApiResult};
use crate::web::state::ManagementState;

/// POST /messages
///
/// Publishes the message as given; an existing `message_id` is kept, a missing one assigned.
pub async fn publish_message(
    State(state): State<ManagementState>,
    payload: Result<Json<PublishMessageRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<PublishMessageResponse>)> {
    let Json(request) = payload?;
    let message = request
        .message
        .filter(|m| !m.is_null())
        .ok_or_else(|| ApiError::bad_request("message is required"))?;
    let exchange = request.exchange_name.unwrap_or_default();
    let routing_key = request.routing_key.unwrap_or_default();

    let (message_id, _) = state
        .broker
        .publish_message(&exchange, &routing_key, message)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(PublishMessageResponse {
            message_id: message_id.to_string(),
            message: format!("Message published to \"{exchange}\" with key \"{routing_key}\""),
        }),
    ))
}
