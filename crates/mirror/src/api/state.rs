//! Application state shared across handlers.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::hub::Hub;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            hub: Hub::new(config.hub.clone()),
            config: Arc::new(config),
        }
    }
}
