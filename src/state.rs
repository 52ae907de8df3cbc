use std::sync::Arc;

use crate::{metrics::AppMetrics, registry::Registry};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub metrics: Arc<AppMetrics>,
}

impl AppState {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            metrics: Arc::new(AppMetrics::new()),
        }
    }
}
