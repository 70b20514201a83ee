//! Types shared between the management HTTP service and its clients.

pub mod api;
