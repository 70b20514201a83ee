//! # Management API Handlers

pub mod health;
pub mod messages;
pub mod topology;

use crate::web::errors::{ApiError, ApiResult};

/// Non-blank required string field
pub(crate) fn required(value: Option<String>, field: &str) -> ApiResult<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("{field} is required")))
}
