//! Configuration for the relay.

use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the relay.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Known points of presence, in order of preference for fallback.
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Name of the region this process serves.
    #[serde(default = "default_region")]
    pub region: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            region: default_region(),
        }
    }
}

/// Session, liveness and transport settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Time allowed between socket upgrade and the handshake frame.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Heartbeat period advertised to clients.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Silence after which a connection is parked.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// How long a parked connection keeps its slots.
    #[serde(default = "default_grace_window")]
    pub grace_window_secs: u64,
    /// How long a new trainer waits for a simulator before matchmaking fails.
    #[serde(default = "default_pairing_wait")]
    pub pairing_wait_secs: u64,
    /// Per-connection outbound queue depth. A full queue back-pressures the sender.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Refuse upgrades that did not arrive over TLS (per `X-Forwarded-Proto`).
    #[serde(default)]
    pub require_tls: bool,
    /// HMAC secret for session tokens. A random secret is generated when empty.
    #[serde(default)]
    pub token_secret: String,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            grace_window_secs: default_grace_window(),
            pairing_wait_secs: default_pairing_wait(),
            outbound_buffer: default_outbound_buffer(),
            require_tls: false,
            token_secret: String::new(),
            token_ttl_secs: default_token_ttl(),
        }
    }
}

impl RelayConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.grace_window_secs)
    }

    pub fn pairing_wait(&self) -> Duration {
        Duration::from_secs(self.pairing_wait_secs)
    }
}

/// Credit metering settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    /// Smallest billable message.
    #[serde(default = "default_min_charge")]
    pub min_charge_bytes: u64,
    /// Deposit window size; one wallet debit of 1 MB per window.
    #[serde(default = "default_deposit")]
    pub deposit_bytes: u64,
    /// Idle connections are charged one deposit per interval.
    #[serde(default = "default_idle_interval")]
    pub idle_charge_interval_secs: u64,
    /// Minimum spacing of low-balance notices per account.
    #[serde(default = "default_notice_interval")]
    pub low_balance_notice_secs: u64,
    /// Data rate for an exhausted account, in KiB/s. Zero blocks data frames outright.
    #[serde(default = "default_throttle_rate")]
    pub throttled_kib_per_sec: u32,
    /// KiB an exhausted account may send at once before the rate applies.
    #[serde(default = "default_throttle_burst")]
    pub throttled_burst_kib: u32,
    /// After this long exhausted, data frames are dropped instead of throttled.
    #[serde(default = "default_hard_stop")]
    pub hard_stop_after_secs: u64,
    /// Idle billing / notice sweep period.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// How often wallets are written back to the ledger.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            min_charge_bytes: default_min_charge(),
            deposit_bytes: default_deposit(),
            idle_charge_interval_secs: default_idle_interval(),
            low_balance_notice_secs: default_notice_interval(),
            throttled_kib_per_sec: default_throttle_rate(),
            throttled_burst_kib: default_throttle_burst(),
            hard_stop_after_secs: default_hard_stop(),
            sweep_interval_secs: default_sweep_interval(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

impl BillingConfig {
    pub fn idle_charge_interval(&self) -> Duration {
        Duration::from_secs(self.idle_charge_interval_secs)
    }

    pub fn low_balance_notice(&self) -> Duration {
        Duration::from_secs(self.low_balance_notice_secs)
    }

    pub fn hard_stop_after(&self) -> Duration {
        Duration::from_secs(self.hard_stop_after_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

/// Operator API settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AdminConfig {
    /// Bearer token for `/admin` and `/dashboard`. Those routes reject everything when unset.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// A point of presence.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    /// WebSocket URL clients are redirected to.
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub operational: bool,
    /// Client networks served by this region (e.g. "10.20.0.0/16").
    #[serde(default)]
    pub networks: Vec<String>,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_region() -> String {
    "local".to_string()
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_heartbeat_timeout() -> u64 {
    30
}
fn default_grace_window() -> u64 {
    120
}
fn default_pairing_wait() -> u64 {
    30
}
fn default_outbound_buffer() -> usize {
    64
}
fn default_token_ttl() -> u64 {
    86_400
}
fn default_min_charge() -> u64 {
    10 * 1024
}
fn default_deposit() -> u64 {
    1024 * 1024
}
fn default_idle_interval() -> u64 {
    300
}
fn default_notice_interval() -> u64 {
    300
}
fn default_throttle_rate() -> u32 {
    256
}
fn default_throttle_burst() -> u32 {
    64
}
fn default_hard_stop() -> u64 {
    1800
}
fn default_sweep_interval() -> u64 {
    5
}
fn default_flush_interval() -> u64 {
    30
}
fn default_database_url() -> String {
    "sqlite:./data/remoterl.db".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            relay: RelayConfig::default(),
            billing: BillingConfig::default(),
            database: DatabaseConfig::default(),
            admin: AdminConfig::default(),
            logging: LoggingConfig::default(),
            regions: vec![],
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (RELAY__SECTION__KEY format)
    /// 2. relay.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default("relay.grace_window_secs", default_grace_window() as i64)?
            .add_source(File::with_name("relay").required(false))
            .add_source(
                Environment::with_prefix("RELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_relay_config() {
        let relay = RelayConfig::default();
        assert_eq!(relay.grace_window(), Duration::from_secs(120));
        assert!(relay.heartbeat_timeout() < relay.grace_window());
        assert!(!relay.require_tls);
    }

    #[test]
    fn test_default_billing_config() {
        let billing = BillingConfig::default();
        assert_eq!(billing.min_charge_bytes, 10 * 1024);
        assert_eq!(billing.deposit_bytes, 1024 * 1024);
        assert_eq!(billing.idle_charge_interval(), Duration::from_secs(300));
        assert_eq!(billing.low_balance_notice(), Duration::from_secs(300));
    }

    #[test]
    fn test_region_config_from_toml() {
        let loaded = ConfigLoader::builder()
            .add_source(config::File::from_str(
                r#"
                [server]
                region = "eu-west"

                [[regions]]
                name = "eu-west"
                endpoint = "wss://eu.relay.example/ws"
                networks = ["10.1.0.0/16"]

                [[regions]]
                name = "us-east"
                endpoint = "wss://us.relay.example/ws"
                operational = false
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: Config = loaded.try_deserialize().unwrap();

        assert_eq!(config.server.region, "eu-west");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.regions.len(), 2);
        assert!(config.regions[0].operational);
        assert!(!config.regions[1].operational);
        assert_eq!(config.regions[0].networks, vec!["10.1.0.0/16".to_string()]);
    }
}
