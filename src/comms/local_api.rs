use anyhow::Result;
use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::commands::helper::ShellHelper;
use crate::config::Config;
use crate::proxy::forward::{ReqwestDispatch, UpstreamResponse};
use crate::proxy::ProxyService;

pub struct AppState {
    pub proxy: ProxyService,
}

impl AppState {
    pub fn new(config: &Config) -> Result<Self> {
        let runner = Arc::new(ShellHelper::new());
        let dispatch = Arc::new(ReqwestDispatch::new()?);
        Ok(Self {
            proxy: ProxyService::new(config, runner, dispatch),
        })
    }
}

type SharedState = Arc<AppState>;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// Health check
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// Every non-health request, any method, goes through the proxy flow.
async fn proxy_handler(
    State(state): State<SharedState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let body_bytes = if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
        match to_bytes(body, usize::MAX).await {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                error!(error = %err, "failed to read inbound request body");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("reading request body: {err}"),
                );
            }
        }
    } else {
        None
    };

    match state
        .proxy
        .handle(method, &path_and_query, &headers, body_bytes)
        .await
    {
        Ok(upstream) => mirror_response(upstream),
        Err(failure) => error_response(failure.status, failure.message),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorResponse { error: message })).into_response()
}

// Relay upstream status and body verbatim; upstream Content-Type when
// present, JSON otherwise.
fn mirror_response(upstream: UpstreamResponse) -> Response {
    let content_type = upstream
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));

    (
        upstream.status,
        [(header::CONTENT_TYPE, content_type)],
        upstream.body,
    )
        .into_response()
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(proxy_handler)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(config: Config) -> Result<()> {
    let port = config.port;
    let state = Arc::new(AppState::new(&config)?);
    let app = create_router(state);

    // Loopback only: this listener attaches credentials to whatever it
    // forwards, so it must not be reachable from other hosts.
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    info!("proxy listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received, stopping proxy");
}
