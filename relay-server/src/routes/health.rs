use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    region: String,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        region: state.regions.local_region().to_string(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let version = env!("CARGO_PKG_VERSION");
    let connections = state.registry.connections();
    let active = connections.iter().filter(|c| c.is_active()).count();
    let body = format!(
        "# HELP remoterl_up Whether the relay is up\n\
         # TYPE remoterl_up gauge\n\
         remoterl_up 1\n\
         # HELP remoterl_info Relay information\n\
         # TYPE remoterl_info gauge\n\
         remoterl_info{{version=\"{}\",region=\"{}\"}} 1\n\
         # HELP remoterl_connections Connections known to the relay\n\
         # TYPE remoterl_connections gauge\n\
         remoterl_connections{{state=\"active\"}} {}\n\
         remoterl_connections{{state=\"parked\"}} {}\n\
         # HELP remoterl_sessions Open sessions\n\
         # TYPE remoterl_sessions gauge\n\
         remoterl_sessions {}\n",
        version,
        state.regions.local_region(),
        active,
        connections.len().saturating_sub(active),
        state.registry.session_count(),
    );
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}
