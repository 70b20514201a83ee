//! # Structured Logging Module
//!
//! Environment-aware structured logging for the broker, producer, consumer loops and the
//! aggregation engine. Console output is human readable by default and switches to JSON
//! lines when `BROKER_LOG_FORMAT=json`.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let json = std::env::var("BROKER_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // Use try_init to avoid panic if a global subscriber is already set
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json_output = json,
            "Structured logging initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("BROKER_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for topology declarations
pub fn log_topology_operation(operation: &str, resource: &str, name: &str, status: &str) {
    tracing::info!(
        operation = %operation,
        resource = %resource,
        name = %name,
        status = %status,
        timestamp = %Utc::now().to_rfc3339(),
        "TOPOLOGY_OPERATION"
    );
}

/// Log structured data for publish attempts
pub fn log_publish_operation(
    strategy: &str,
    exchange: &str,
    routing_key: &str,
    message_id: Option<&str>,
    status: &str,
) {
    tracing::info!(
        strategy = %strategy,
        exchange = %exchange,
        routing_key = %routing_key,
        message_id = message_id,
        status = %status,
        timestamp = %Utc::now().to_rfc3339(),
        "PUBLISH_OPERATION"
    );
}

/// Log structured data for message consumption outcomes
pub fn log_consume_operation(
    consumer_id: &str,
    queue: &str,
    message_id: Option<&str>,
    outcome: &str,
    details: Option<&str>,
) {
    tracing::info!(
        consumer_id = %consumer_id,
        queue = %queue,
        message_id = message_id,
        outcome = %outcome,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "CONSUME_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}
