use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    errors::AppError,
    models::{ChatRequest, ModelInfo},
    state::AppState,
};

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelInfo>> {
    let models = state
        .registry
        .entries()
        .iter()
        .map(|entry| ModelInfo {
            name: entry.name.clone(),
            display_name: entry.display_name.clone(),
            kind: entry.kind,
        })
        .collect();
    Json(models)
}

#[derive(Debug, Deserialize)]
pub struct GenerateQuery {
    #[serde(default)]
    pub model: Option<String>,
}

pub async fn generate(
    State(state): State<AppState>,
    Query(query): Query<GenerateQuery>,
    Json(request): Json<ChatRequest>,
) -> Response {
    let started = Instant::now();
    let _inflight = state.metrics.inflight_guard();

    let response = match process_generate(&state, query, request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };

    state.metrics.observe_request(
        "/api/generate",
        "POST",
        response.status().as_u16(),
        started.elapsed(),
    );

    response
}

async fn process_generate(
    state: &AppState,
    query: GenerateQuery,
    request: ChatRequest,
) -> Result<Response, AppError> {
    let request_id = format!("req_{}", Uuid::new_v4());

    let model = match query.model {
        Some(model) => model,
        None => state
            .registry
            .default_model()
            .map(ToOwned::to_owned)
            .ok_or_else(|| AppError::NotFound("no models configured".to_owned()))?,
    };

    let provider = state
        .registry
        .get(&model)
        .map_err(|_| AppError::NotFound(format!("unknown model: {model}")))?;

    info!(
        %request_id,
        model = %model,
        has_system = request.system.is_some(),
        parameters = request.parameters.len(),
        "generation request accepted"
    );

    let stream = provider.stream_chat(request).await.map_err(|error| {
        state.metrics.observe_upstream_error("connect");
        AppError::Upstream(error.to_string())
    })?;

    // Headers are already committed once the first chunk is out; a provider
    // failure mid-stream aborts the body so the caller sees the break
    // instead of a silently truncated reply.
    let metrics = state.metrics.clone();
    let body = Body::from_stream(stream.map(move |next| match next {
        Ok(chunk) => Ok(Bytes::from(chunk)),
        Err(error) => {
            metrics.observe_upstream_error("stream");
            warn!(%request_id, %error, "upstream stream failed");
            Err(error)
        }
    }));

    Response::builder()
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body)
        .map_err(|error| AppError::Internal(format!("response build failed: {error}")))
}
