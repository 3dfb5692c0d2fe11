use pulse_analytics::AggregateStore;
use pulse_core::config::AppConfig;
use std::sync::Arc;

/// Shared application state for the server.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<AggregateStore>,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<AggregateStore>) -> Self {
        Self { config, store }
    }
}
