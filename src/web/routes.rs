//! # Management API Route Definitions

use axum::routing::{get, post};
use axum::Router;

use crate::web::handlers;
use crate::web::state::ManagementState;

/// Topology and publish routes
pub fn management_routes() -> Router<ManagementState> {
    Router::new()
        .route(
            "/queues",
            post(handlers::topology::create_queue).get(handlers::topology::list_queues),
        )
        .route(
            "/exchanges",
            post(handlers::topology::create_exchange).get(handlers::topology::list_exchanges),
        )
        .route(
            "/bindings",
            post(handlers::topology::create_binding).get(handlers::topology::list_bindings),
        )
        .route("/messages", post(handlers::messages::publish_message))
}

pub fn health_routes() -> Router<ManagementState> {
    Router::new().route("/health", get(handlers::health::health))
}
