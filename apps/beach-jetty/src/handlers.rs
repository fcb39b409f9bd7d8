use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::engine::{RegistrationOutcome, RegistrationRequest, RelayEngine};
use crate::error::RelayError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RelayEngine>,
    pub metrics: Option<PrometheusHandle>,
    pub tcp_addr: SocketAddr,
    pub http_addr: SocketAddr,
}

#[derive(Debug, Serialize)]
pub struct UpstreamResponse {
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl UpstreamResponse {
    fn success(message: &str, identity: Option<String>) -> Self {
        Self {
            status: "success",
            message: message.to_string(),
            identity,
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: "error",
            message,
            identity: None,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::NoPendingConnection => StatusCode::BAD_REQUEST,
            RelayError::DeliveryFailure(_) => StatusCode::BAD_GATEWAY,
            RelayError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(UpstreamResponse::error(self.to_string()))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ClientEntry {
    id: String,
    label: String,
    address: String,
    connected: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/upstream", post(upstream))
        .route("/clients", get(list_clients))
        .route("/status", get(server_status))
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Out-of-band registration call; also carries output when a peer reports it
/// over HTTP instead of its stream.
pub async fn upstream(
    State(state): State<AppState>,
    request: Result<Json<RegistrationRequest>, JsonRejection>,
) -> Response {
    let request = match request {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!(error = %rejection.body_text(), "upstream body rejected");
            let body = UpstreamResponse::error(rejection.body_text());
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };
    debug!(label = %request.label, status = %request.status, "upstream call");
    match state.engine.handle_registration(request).await {
        Ok(RegistrationOutcome::Registered { identity }) => {
            Json(UpstreamResponse::success("Client registered", Some(identity))).into_response()
        }
        Ok(RegistrationOutcome::OutputAccepted { identity }) => {
            Json(UpstreamResponse::success("Data received", identity)).into_response()
        }
        Err(err) => {
            debug!(error = %err, "upstream call rejected");
            err.into_response()
        }
    }
}

pub async fn list_clients(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.engine.snapshot();
    let clients: Vec<ClientEntry> = snapshot
        .sessions
        .into_iter()
        .map(|session| ClientEntry {
            id: session.id,
            label: session.label,
            address: session.address,
            connected: session.connected,
        })
        .collect();
    let count = clients.len();
    Json(json!({ "clients": clients, "count": count }))
}

pub async fn server_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.engine.snapshot();
    Json(json!({
        "status": "running",
        "connected_clients": snapshot.sessions.len(),
        "pending_connections": snapshot.pending_connections,
        "tcp_addr": state.tcp_addr.to_string(),
        "http_addr": state.http_addr.to_string(),
    }))
}

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
