//! # Management HTTP API
//!
//! Axum facade over [`Broker`](crate::messaging::Broker): declare and list topology,
//! publish messages, report health. Request and response bodies use camelCase JSON.

pub mod errors;
pub mod handlers;
pub mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub use errors::{ApiError, ApiResult};
pub use state::ManagementState;

/// Build the management router with its middleware stack
pub fn create_app(state: ManagementState) -> Router {
    let request_timeout = state.config.request_timeout();

    Router::new()
        .merge(routes::health_routes())
        .merge(routes::management_routes())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
