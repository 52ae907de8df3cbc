pub mod config;
pub mod errors;
pub mod gateway;
pub mod metrics;
pub mod models;
pub mod provider;
pub mod registry;
pub mod runtime;
pub mod state;

use axum::{
    routing::{get, post},
    Router,
};

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/healthz", get(gateway::healthz))
        .route("/metrics", get(gateway::metrics))
        .route("/api/models", get(gateway::list_models))
        .route("/api/generate", post(gateway::generate))
        .with_state(state)
}
