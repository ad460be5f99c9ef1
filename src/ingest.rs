use axum::{
    Router,
    extract::{Json, Path, State},
    http::StatusCode,
    response::Json as ResponseJson,
    routing::{get, post},
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::error::Result;
use crate::monitor::{MonitorHandle, SourceHealth};

#[derive(Clone)]
struct AppState {
    monitor: MonitorHandle,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub success: bool,
    pub queued: usize,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnableRequest {
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct SourcesResponse {
    success: bool,
    sources: Vec<SourceHealth>,
}

/// Push intake for API sources plus read-only status routes.
pub fn router(monitor: MonitorHandle) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sources", get(list_sources))
        .route("/api/sources/:name/messages", post(push_messages))
        .route("/api/sources/:name/enabled", post(set_enabled))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(AppState { monitor })
}

/// Serves the router on `bind` until `shutdown` resolves.
pub async fn serve<F>(bind: &str, monitor: MonitorHandle, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("🌐 Ingest server listening on http://{}", bind);
    axum::serve(listener, router(monitor))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Ingest server stopped");
    Ok(())
}

async fn health(State(state): State<AppState>) -> ResponseJson<Value> {
    ResponseJson(state.monitor.status())
}

async fn list_sources(State(state): State<AppState>) -> ResponseJson<SourcesResponse> {
    ResponseJson(SourcesResponse {
        success: true,
        sources: state.monitor.health(),
    })
}

/// Accepts one push payload or an array of them.
async fn push_messages(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, ResponseJson<IngestResponse>) {
    let Some(inbox) = state.monitor.inbox(&name) else {
        return (
            StatusCode::NOT_FOUND,
            ResponseJson(IngestResponse {
                success: false,
                queued: 0,
                message: Some(format!("no push source named '{}'", name)),
            }),
        );
    };

    let enabled = state
        .monitor
        .source_health(&name)
        .map(|h| h.enabled)
        .unwrap_or(false);
    if !enabled || !inbox.is_accepting() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            ResponseJson(IngestResponse {
                success: false,
                queued: 0,
                message: Some(format!("source '{}' is disabled or missing credentials", name)),
            }),
        );
    }

    let payloads = match body {
        Value::Array(items) => items,
        single => vec![single],
    };
    let queued = payloads
        .into_iter()
        .map(|payload| inbox.push(payload))
        .filter(|accepted| *accepted)
        .count();
    debug!("Queued {} payloads for source '{}'", queued, name);

    (
        StatusCode::ACCEPTED,
        ResponseJson(IngestResponse {
            success: true,
            queued,
            message: None,
        }),
    )
}

async fn set_enabled(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<EnableRequest>,
) -> StatusCode {
    if state.monitor.set_source_enabled(&name, request.enabled) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
