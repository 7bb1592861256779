//! Admin API routes.
//!
//! Provides:
//! - Account creation, returning the API key once (`POST /admin/accounts`)
//! - Credit top-up (`POST /admin/accounts/:id/top-up`)
//! - Status changes (`POST /admin/accounts/:id/status`)

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::require_operator;
use crate::accounts::{Account, AccountStatus, NewAccount};
use crate::billing::WalletSnapshot;
use crate::error::RelayError;
use crate::AppState;

/// Response for a newly created account.
#[derive(Debug, Serialize)]
pub struct CreatedAccount {
    pub account: Account,
    /// Only shown here; the ledger keeps the hash.
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct TopUpRequest {
    pub mb: u64,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: AccountStatus,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub account_id: String,
    pub status: AccountStatus,
    /// Connections closed because the account expired.
    pub closed_connections: usize,
}

async fn create_account(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewAccount>,
) -> Result<impl IntoResponse, RelayError> {
    let (account, api_key) = state.ledger.create_account(request)?;
    tracing::info!(account = %account.id, balance_mb = account.balance_mb, "Account created");
    Ok((StatusCode::CREATED, Json(CreatedAccount { account, api_key })))
}

async fn list_accounts(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Account>>, RelayError> {
    Ok(Json(state.ledger.list()?))
}

async fn top_up(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<TopUpRequest>,
) -> Result<Json<WalletSnapshot>, RelayError> {
    if request.mb == 0 {
        return Err(RelayError::InvalidParameter("mb must be positive".to_string()));
    }
    Ok(Json(state.meter.top_up(&id, request.mb)?))
}

async fn set_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<StatusResponse>, RelayError> {
    if !state.ledger.set_status(&id, request.status)? {
        return Err(RelayError::AccountNotFound(id));
    }
    tracing::info!(account = %id, status = ?request.status, "Account status changed");

    let mut closed_connections = 0;
    if request.status == AccountStatus::Expired {
        let frame = RelayError::ExpiredApiKey.to_frame();
        for conn in state.registry.connections_for_account(&id) {
            conn.close(Some(frame.clone()));
            state.supervisor.terminate(&conn, "API key expired").await;
            closed_connections += 1;
        }
    }

    Ok(Json(StatusResponse {
        account_id: id,
        status: request.status,
        closed_connections,
    }))
}

/// Build the admin router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/accounts", post(create_account).get(list_accounts))
        .route("/accounts/:id/top-up", post(top_up))
        .route("/accounts/:id/status", post(set_status))
        .layer(middleware::from_fn_with_state(state.clone(), require_operator))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_request_deserialize() {
        let req: StatusRequest = serde_json::from_str(r#"{"status":"expired"}"#).unwrap();
        assert_eq!(req.status, AccountStatus::Expired);
        assert!(serde_json::from_str::<StatusRequest>(r#"{"status":"frozen"}"#).is_err());
    }

    #[test]
    fn test_top_up_request_deserialize() {
        let req: TopUpRequest = serde_json::from_str(r#"{"mb":64}"#).unwrap();
        assert_eq!(req.mb, 64);
    }
}
