//! Helpers shared by unit and integration tests.

use crate::accounts::{Account, NewAccount};
use crate::config::{
    AdminConfig, BillingConfig, Config, DatabaseConfig, LoggingConfig, RelayConfig, ServerConfig,
};
use crate::AppState;

pub const TEST_ADMIN_TOKEN: &str = "test-admin-token";

/// Config for tests: a ledger at `database_url`, a known admin token and
/// short waits.
pub fn test_config(database_url: &str) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            region: "local".to_string(),
        },
        relay: RelayConfig {
            handshake_timeout_secs: 5,
            pairing_wait_secs: 5,
            token_secret: "test-token-secret".to_string(),
            ..RelayConfig::default()
        },
        billing: BillingConfig::default(),
        database: DatabaseConfig {
            url: database_url.to_string(),
        },
        admin: AdminConfig {
            token: Some(TEST_ADMIN_TOKEN.to_string()),
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
        },
        regions: vec![],
    }
}

pub fn create_test_state(database_url: &str) -> AppState {
    AppState::new(test_config(database_url)).expect("failed to open test ledger")
}

/// Create an account with `balance_mb` of credit. Returns it with its API key.
pub fn create_test_account(state: &AppState, balance_mb: u64) -> (Account, String) {
    state
        .ledger
        .create_account(NewAccount {
            label: Some("test".to_string()),
            balance_mb,
            ..NewAccount::default()
        })
        .expect("failed to create test account")
}
