//! HTTP front end: `POST /v1/messages`, `GET /health`, everything else 404.

use crate::config::RouterConfig;
use crate::proxy::{self, DispatchOutcome};
use crate::translate::anthropic_types::{ErrorResponse, MessagesRequest};
use crate::upstream::UpstreamClient;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

pub struct AppState {
    pub config: RouterConfig,
    pub upstream: UpstreamClient,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/health", get(handle_health))
        .fallback(handle_not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // The proxy forwards whatever credential the client presented; it never
    // holds one of its own.
    let Some(api_key) = extract_api_key(&headers) else {
        let err = ErrorResponse::authentication(
            "Missing API key: set an Authorization bearer token or x-api-key header",
        );
        return (StatusCode::UNAUTHORIZED, Json(err)).into_response();
    };

    let req: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "rejecting malformed request body");
            let err = ErrorResponse::invalid_request(format!("Invalid request body: {e}"));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };

    if req.stream.unwrap_or(false) {
        handle_streaming(state, &req, &api_key).await
    } else {
        handle_non_streaming(state, &req, &api_key).await
    }
}

async fn handle_non_streaming(
    state: Arc<AppState>,
    req: &MessagesRequest,
    api_key: &str,
) -> Response {
    match proxy::dispatch_non_streaming(req, api_key, &state.config, &state.upstream).await {
        Ok(DispatchOutcome::Success(resp)) => Json(resp).into_response(),
        Ok(DispatchOutcome::Error(err, status)) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(err)).into_response()
        }
        Err(e) => {
            warn!(error = %e, "dispatch failed");
            let err = ErrorResponse::api_error(format!("Upstream failure: {e}"));
            (StatusCode::BAD_GATEWAY, Json(err)).into_response()
        }
    }
}

async fn handle_streaming(state: Arc<AppState>, req: &MessagesRequest, api_key: &str) -> Response {
    let sse_stream =
        proxy::dispatch_streaming(req, api_key, &state.config, &state.upstream).await;

    let event_stream = sse_stream.map(|result| -> Result<Event, Infallible> {
        match result {
            Ok(sse) => Ok(Event::default().event(sse.event).data(sse.data)),
            Err(_) => Ok(Event::default().event("error").data("{}")),
        }
    });

    (
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(event_stream).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "proxy": "model-router",
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": {
            "supports_responses": true,
            "retry_on_not_chat_model": true,
        },
    }))
}

async fn handle_not_found() -> Response {
    let err = ErrorResponse::not_found("The requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err)).into_response()
}

/// `x-api-key` wins, then `Authorization: Bearer <token>`.
fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
    {
        return Some(key.to_string());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| {
            let (scheme, token) = auth.split_once(' ')?;
            scheme
                .eq_ignore_ascii_case("bearer")
                .then(|| token.trim().to_string())
        })
        .filter(|t| !t.is_empty())
}
