//! Operator HTTP routes.

pub mod admin;
pub mod dashboard;
pub mod health;

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::AppState;

/// Middleware that requires `Authorization: Bearer <admin token>`.
///
/// With no admin token configured every request is refused.
pub(crate) async fn require_operator(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match (state.config.admin.token.as_deref(), presented) {
        (Some(expected), Some(token)) if !expected.is_empty() && token == expected => {
            next.run(request).await
        }
        (None, _) => {
            tracing::warn!("Operator request refused: no admin token configured");
            unauthorized()
        }
        _ => unauthorized(),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "code": "AUTH-102",
                "headline": "Unauthorized",
                "details": "Please provide a valid Bearer token.",
            }
        })),
    )
        .into_response()
}
