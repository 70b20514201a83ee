//! # Health Check Handler

use axum::extract::State;
use axum::Json;
use tracing::debug;

use crate::types::api::HealthResponse;
use crate::web::state::ManagementState;

/// GET /health
///
/// Always answers; `status` is `degraded` while the broker channel is down.
pub async fn health(State(state): State<ManagementState>) -> Json<HealthResponse> {
    let broker = state.broker.health().await;
    let status = if broker.connected { "healthy" } else { "degraded" };
    debug!(status = status, generation = broker.generation, "Health check");
    Json(HealthResponse {
        status: status.to_string(),
        timestamp: chrono::Utc::now(),
        broker,
    })
}
