//! Per-account dashboard view: presence, usage and coarse liveness.
//!
//! Never exposes payload content, only counters and connection metadata.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    middleware,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::require_operator;
use crate::accounts::{AccountStatus, Quotas};
use crate::error::RelayError;
use crate::session::{ConnectionSnapshot, ConnectionState, SessionSnapshot};
use crate::AppState;

/// Dashboard view of one account.
#[derive(Debug, Clone, Serialize)]
pub struct AccountDashboard {
    pub account_id: String,
    pub label: Option<String>,
    pub status: AccountStatus,
    pub home_region: Option<String>,
    /// At least one connection is active.
    pub online: bool,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub balance_mb: u64,
    pub used_data_mb: u64,
    pub deficit_mb: u64,
    pub exhausted: bool,
    pub last_deposit_at: Option<DateTime<Utc>>,
    pub quotas: Quotas,
    pub connections: Vec<ConnectionSnapshot>,
    pub sessions: Vec<SessionSnapshot>,
}

/// One line of the account list.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub account_id: String,
    pub label: Option<String>,
    pub status: AccountStatus,
    pub online: bool,
    pub balance_mb: u64,
    pub used_data_mb: u64,
}

async fn account_dashboard(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<AccountDashboard>, RelayError> {
    let account = state
        .ledger
        .get(&id)?
        .ok_or_else(|| RelayError::AccountNotFound(id.clone()))?;

    let connections: Vec<ConnectionSnapshot> = state
        .registry
        .connections_for_account(&id)
        .iter()
        .map(|c| c.snapshot())
        .collect();
    let online = connections
        .iter()
        .any(|c| c.state == ConnectionState::Active);
    let sessions = state.registry.sessions_for_account(&id).await;

    // the in-memory wallet is authoritative while one is loaded
    let (balance_mb, used_data_mb, deficit_mb, exhausted, last_deposit_at) =
        match state.meter.snapshot(&id) {
            Some(w) => (w.balance_mb, w.used_data_mb, w.deficit_mb, w.exhausted, w.last_deposit_at),
            None => (
                account.balance_mb,
                account.used_data_mb,
                0,
                account.is_exhausted(),
                account.last_deposit_at,
            ),
        };

    Ok(Json(AccountDashboard {
        account_id: account.id,
        label: account.label,
        status: account.status,
        home_region: account.home_region,
        online,
        first_seen_at: account.first_seen_at,
        balance_mb,
        used_data_mb,
        deficit_mb,
        exhausted,
        last_deposit_at,
        quotas: account.quotas,
        connections,
        sessions,
    }))
}

async fn list_accounts(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<AccountSummary>>, RelayError> {
    let accounts = state.ledger.list()?;
    let summaries = accounts
        .into_iter()
        .map(|account| {
            let online = state
                .registry
                .connections_for_account(&account.id)
                .iter()
                .any(|c| c.is_active());
            let (balance_mb, used_data_mb) = match state.meter.snapshot(&account.id) {
                Some(w) => (w.balance_mb, w.used_data_mb),
                None => (account.balance_mb, account.used_data_mb),
            };
            AccountSummary {
                account_id: account.id,
                label: account.label,
                status: account.status,
                online,
                balance_mb,
                used_data_mb,
            }
        })
        .collect();
    Ok(Json(summaries))
}

/// Build the dashboard router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/dashboard/accounts", get(list_accounts))
        .route("/dashboard/accounts/:id", get(account_dashboard))
        .layer(middleware::from_fn_with_state(state.clone(), require_operator))
        .with_state(state)
}
