pub mod accounts;
pub mod billing;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod relay;
pub mod routes;
pub mod session;
pub mod supervisor;
pub mod test_util;

pub use accounts::{Account, AccountLedger, AccountStatus, NewAccount, Quotas};
pub use billing::{Admission, CreditMeter, WalletSnapshot};
pub use config::{BillingConfig, Config, RegionConfig, RelayConfig};
pub use error::RelayError;
pub use gateway::{RegionDecision, RegionRouter, TokenIssuer};
pub use relay::{DropReason, Forwarded, Relay};
pub use session::{Connection, SessionRegistry};
pub use supervisor::ReconnectionSupervisor;

use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, routing::get, Router};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::accounts::LedgerError;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Accounts, API key hashes and persisted wallets.
    pub ledger: Arc<AccountLedger>,
    /// Live connections and sessions.
    pub registry: Arc<SessionRegistry>,
    pub meter: Arc<CreditMeter>,
    /// Data-frame forwarding.
    pub relay: Relay,
    /// Parking, resume and teardown of connections.
    pub supervisor: Arc<ReconnectionSupervisor>,
    pub regions: RegionRouter,
    pub tokens: TokenIssuer,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, LedgerError> {
        let ledger = Arc::new(AccountLedger::new(&config.database.url)?);
        let registry = Arc::new(SessionRegistry::new());
        let meter = Arc::new(CreditMeter::new(config.billing.clone(), ledger.clone()));
        let relay = Relay::new(registry.clone(), meter.clone());
        let supervisor = Arc::new(ReconnectionSupervisor::new(
            registry.clone(),
            config.relay.grace_window(),
        ));
        let regions = RegionRouter::new(&config.server.region, &config.regions);
        let tokens = TokenIssuer::new(
            &config.relay.token_secret,
            Duration::from_secs(config.relay.token_ttl_secs),
        );

        Ok(Self {
            config,
            ledger,
            registry,
            meter,
            relay,
            supervisor,
            regions,
            tokens,
        })
    }
}

/// Build the relay router: the WebSocket endpoint plus the operator routes.
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(gateway::ws_handler))
        .with_state(state.clone())
        .merge(routes::health::router(state.clone()))
        .merge(routes::dashboard::router(state.clone()))
        .nest("/admin", routes::admin::router(state))
        .layer(middleware::from_fn(logging::request_logger))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Start the idle-billing sweeper and the wallet flusher.
pub fn spawn_background(state: &AppState) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(billing::meter::run_sweeper(
            state.meter.clone(),
            state.registry.clone(),
        )),
        tokio::spawn(billing::meter::run_flusher(state.meter.clone())),
    ]
}
