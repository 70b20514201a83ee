//! # Management API state

use std::sync::Arc;

use crate::config::ManagementConfig;
use crate::messaging::Broker;

/// Shared state for every management request handler
#[derive(Clone, Debug)]
pub struct ManagementState {
    pub broker: Arc<Broker>,
    pub config: Arc<ManagementConfig>,
}

impl ManagementState {
    pub fn new(broker: Arc<Broker>, config: ManagementConfig) -> Self {
        Self {
            broker,
            config: Arc::new(config),
        }
    }
}
