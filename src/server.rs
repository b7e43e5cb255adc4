use crate::auth;
use crate::backend::OllamaClient;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogLevel, SharedLogger};
use crate::proxy::{FrameStream, Proxy};
use crate::translate::openai_types::{ChatCompletionRequest, CompletionRequest, ErrorResponse};
use crate::translate::request::RequestTranslator;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub proxy: Proxy,
    /// Bearer token clients must present; `None` disables the check.
    pub api_key: Option<String>,
    pub logger: SharedLogger,
}

impl AppState {
    pub fn new(config: &ProxyConfig, api_key: Option<String>, logger: SharedLogger) -> Result<Self> {
        let proxy = Proxy {
            backend: OllamaClient::new(&config.backend)?,
            translator: RequestTranslator::new(&config.backend),
            stream: config.stream.clone(),
            logger: logger.clone(),
        };

        Ok(Self {
            proxy,
            api_key,
            logger,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let v1 = Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/completions", post(handle_completions))
        .route("/v1/models", get(handle_models))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(handle_health))
        .merge(v1)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let req: ChatCompletionRequest = match parse_body(&state, &body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    if req.model.is_empty() {
        return bad_request("missing_model", "Model is required");
    }
    if req.messages.is_empty() {
        return bad_request("missing_messages", "Messages are required");
    }

    let is_streaming = req.stream.unwrap_or(false);

    state.logger.info(
        "server",
        format!(
            "Chat request: model={} streaming={} messages={}",
            req.model,
            is_streaming,
            req.messages.len()
        ),
    );

    if is_streaming {
        match state.proxy.chat_stream(&req).await {
            Ok(frames) => sse_response(frames),
            Err(e) => backend_failure(&state, "ollama_stream_error", &e),
        }
    } else {
        match state.proxy.chat(&req).await {
            Ok(resp) => Json(resp).into_response(),
            Err(e) => backend_failure(&state, "ollama_error", &e),
        }
    }
}

async fn handle_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let req: CompletionRequest = match parse_body(&state, &body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    if req.model.is_empty() {
        return bad_request("missing_model", "Model is required");
    }
    if req.prompt.is_none() {
        return bad_request("missing_prompt", "Prompt is required");
    }

    let is_streaming = req.stream.unwrap_or(false);

    state.logger.info(
        "server",
        format!(
            "Completion request: model={} streaming={}",
            req.model, is_streaming
        ),
    );

    let result = if is_streaming {
        state.proxy.completion_stream(&req).await.map(sse_response)
    } else {
        state
            .proxy
            .completion(&req)
            .await
            .map(|resp| Json(resp).into_response())
    };

    match result {
        Ok(resp) => resp,
        Err(e) if e.is_client_error() => bad_request("invalid_prompt", e.to_string()),
        Err(e) if is_streaming => backend_failure(&state, "ollama_stream_error", &e),
        Err(e) => backend_failure(&state, "ollama_error", &e),
    }
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Response {
    match state.proxy.models().await {
        Ok(list) => Json(list).into_response(),
        Err(e) => backend_failure(&state, "ollama_error", &e),
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "message": "OpenAI compatible API is running",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn parse_body<T: DeserializeOwned>(
    state: &AppState,
    body: &[u8],
) -> std::result::Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| {
        state
            .logger
            .warn("server", format!("Failed to parse request: {}", e));
        bad_request("invalid_json", format!("Invalid request body: {}", e))
    })
}

fn bad_request(code: &str, message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::invalid_request(code, message)),
    )
        .into_response()
}

/// Log the backend detail and answer with a generic 500.
fn backend_failure(state: &AppState, code: &str, err: &ProxyError) -> Response {
    state.logger.log_with_context(
        LogLevel::Error,
        "server",
        format!("{code}: {err}"),
        serde_json::json!({ "code": code }),
    );
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::internal(code)),
    )
        .into_response()
}

fn sse_response(frames: FrameStream) -> Response {
    let body = Body::from_stream(frames.map(Ok::<_, Infallible>));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
