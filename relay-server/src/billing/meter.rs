//! Credit meter.
//!
//! Bytes are billed when a frame is forwarded. Each connection accumulates
//! charges in its [`DepositWindow`]; every full window debits one deposit
//! from the account wallet. Exhausted accounts keep working at a throttled
//! byte rate until the hard-stop delay passes, after which data frames are
//! refused until a top-up.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use remoterl_common::ServerMessage;
use tokio::time::{interval, Instant, MissedTickBehavior};

use super::wallet::{Debit, Wallet, WalletSnapshot};
use crate::accounts::{Account, AccountLedger, LedgerError};
use crate::config::BillingConfig;
use crate::error::RelayError;
use crate::session::{Connection, ConnectionState, SessionRegistry};

const CELL_BYTES: u64 = 1024;

/// Degraded byte rate of an exhausted account. One limiter cell is one KiB.
pub struct Throttle {
    limiter: DefaultDirectRateLimiter,
    burst: NonZeroU32,
}

impl Throttle {
    pub fn new(kib_per_sec: NonZeroU32, burst_kib: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::direct(Quota::per_second(kib_per_sec).allow_burst(burst_kib)),
            burst: burst_kib,
        }
    }

    /// Wait until a frame of `bytes` fits the rate. Frames larger than the
    /// burst are paid for in burst-sized pieces.
    pub async fn wait(&self, bytes: usize) {
        let mut cells = (bytes as u64).div_ceil(CELL_BYTES).max(1);
        while cells > 0 {
            let take = cells.min(u64::from(self.burst.get()));
            let Some(n) = u32::try_from(take).ok().and_then(NonZeroU32::new) else {
                return;
            };
            if self.limiter.until_n_ready(n).await.is_err() {
                return;
            }
            cells -= take;
        }
    }
}

/// Whether an account's data frames may pass.
#[derive(Clone)]
pub enum Admission {
    Open,
    /// Wait on the throttle before forwarding.
    Throttled(Arc<Throttle>),
    Blocked,
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Admission::Open => write!(f, "Open"),
            Admission::Throttled(_) => write!(f, "Throttled"),
            Admission::Blocked => write!(f, "Blocked"),
        }
    }
}

pub struct CreditMeter {
    config: BillingConfig,
    ledger: Arc<AccountLedger>,
    wallets: DashMap<String, Arc<Mutex<Wallet>>>,
    throttles: DashMap<String, Arc<Throttle>>,
    last_notice: DashMap<String, Instant>,
}

fn lock(wallet: &Mutex<Wallet>) -> MutexGuard<'_, Wallet> {
    wallet.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CreditMeter {
    pub fn new(config: BillingConfig, ledger: Arc<AccountLedger>) -> Self {
        Self {
            config,
            ledger,
            wallets: DashMap::new(),
            throttles: DashMap::new(),
            last_notice: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Load the account's wallet if it is not cached yet.
    pub fn open_wallet(&self, account: &Account) -> WalletSnapshot {
        let wallet = self
            .wallets
            .entry(account.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Wallet::from_account(account))))
            .clone();
        let snapshot = lock(&wallet).snapshot();
        snapshot
    }

    fn wallet(&self, account_id: &str) -> Option<Arc<Mutex<Wallet>>> {
        self.wallets.get(account_id).map(|w| w.clone())
    }

    pub fn snapshot(&self, account_id: &str) -> Option<WalletSnapshot> {
        self.wallet(account_id).map(|w| {
            let wallet = lock(&w);
            wallet.snapshot()
        })
    }

    pub fn is_exhausted(&self, account_id: &str) -> bool {
        self.wallet(account_id)
            .map(|w| {
                let wallet = lock(&w);
                wallet.is_exhausted()
            })
            .unwrap_or(false)
    }

    /// Decide how the account's next data frame is treated.
    pub fn admit(&self, account_id: &str) -> Admission {
        let Some(wallet) = self.wallet(account_id) else {
            return Admission::Open;
        };
        let exhausted_since = {
            let wallet = lock(&wallet);
            if !wallet.is_exhausted() {
                return Admission::Open;
            }
            wallet.exhausted_since()
        };

        if let Some(since) = exhausted_since {
            if since.elapsed() >= self.config.hard_stop_after() {
                return Admission::Blocked;
            }
        }

        match NonZeroU32::new(self.config.throttled_kib_per_sec) {
            Some(rate) => {
                let burst = NonZeroU32::new(self.config.throttled_burst_kib).unwrap_or(NonZeroU32::MIN);
                let throttle = self
                    .throttles
                    .entry(account_id.to_string())
                    .or_insert_with(|| Arc::new(Throttle::new(rate, burst)))
                    .clone();
                Admission::Throttled(throttle)
            }
            None => Admission::Blocked,
        }
    }

    /// Bill one forwarded frame to the sending connection.
    ///
    /// Returns the debit if the frame completed a deposit window.
    pub fn charge(&self, conn: &Connection, bytes: usize) -> Option<Debit> {
        let due = conn.window().record(
            bytes as u64,
            self.config.min_charge_bytes,
            self.config.deposit_bytes,
        );
        if !due {
            return None;
        }
        self.debit(&conn.account_id)
    }

    fn debit(&self, account_id: &str) -> Option<Debit> {
        let wallet = self.wallet(account_id)?;
        let mut wallet = lock(&wallet);
        let debit = wallet.debit();
        tracing::debug!(
            account = %account_id,
            balance_mb = wallet.balance_mb,
            used_data_mb = wallet.used_data_mb,
            "Deposit debited"
        );
        if debit.newly_exhausted {
            tracing::warn!(account = %account_id, "Account balance exhausted");
        }
        Some(debit)
    }

    /// Charge one deposit to every live connection, parked ones included,
    /// that has been idle for the idle interval. Returns the accounts that
    /// just ran out.
    pub fn charge_idle(&self, connections: &[Arc<Connection>]) -> Vec<String> {
        let now = Instant::now();
        let interval = self.config.idle_charge_interval();
        let mut exhausted = Vec::new();

        for conn in connections {
            if conn.state() == ConnectionState::Terminated {
                continue;
            }
            if !conn.window().idle_due(now, interval) {
                continue;
            }
            if let Some(debit) = self.debit(&conn.account_id) {
                tracing::debug!(connection = %conn.id, "Idle deposit charged");
                if debit.newly_exhausted {
                    exhausted.push(conn.account_id.clone());
                }
            }
        }
        exhausted
    }

    /// Add credit. The wallet is loaded from the ledger first if needed and
    /// written back immediately.
    pub fn top_up(&self, account_id: &str, mb: u64) -> Result<WalletSnapshot, RelayError> {
        if self.wallet(account_id).is_none() {
            let account = self
                .ledger
                .get(account_id)?
                .ok_or_else(|| RelayError::AccountNotFound(account_id.to_string()))?;
            self.open_wallet(&account);
        }
        let wallet = self
            .wallet(account_id)
            .ok_or_else(|| RelayError::AccountNotFound(account_id.to_string()))?;

        let snapshot = {
            let mut wallet = lock(&wallet);
            wallet.top_up(mb);
            wallet.take_dirty();
            wallet.snapshot()
        };
        self.ledger.save_wallet(
            account_id,
            snapshot.balance_mb,
            snapshot.used_data_mb,
            snapshot.last_deposit_at,
            snapshot.exhausted_at,
        )?;

        if !snapshot.exhausted {
            self.throttles.remove(account_id);
            self.last_notice.remove(account_id);
        }
        tracing::info!(account = %account_id, added_mb = mb, balance_mb = snapshot.balance_mb, "Account topped up");
        Ok(snapshot)
    }

    /// Send a low-balance notice to every connection of the account, at most
    /// once per notice interval. Returns whether a notice went out.
    pub fn notify_low_balance(&self, registry: &SessionRegistry, account_id: &str) -> bool {
        let Some(snapshot) = self.snapshot(account_id) else {
            return false;
        };
        if !snapshot.exhausted {
            return false;
        }
        let now = Instant::now();
        if let Some(last) = self.last_notice.get(account_id) {
            if now.duration_since(*last) < self.config.low_balance_notice() {
                return false;
            }
        }
        self.last_notice.insert(account_id.to_string(), now);

        let msg = ServerMessage::LowBalance {
            balance_mb: snapshot.balance_mb,
            used_data_mb: snapshot.used_data_mb,
        };
        for conn in registry.connections_for_account(account_id) {
            conn.send(msg.clone());
        }
        true
    }

    /// Idle billing plus recurring low-balance notices.
    pub fn sweep(&self, registry: &SessionRegistry) {
        let connections = registry.connections();
        self.charge_idle(&connections);

        let mut accounts: Vec<&str> = connections.iter().map(|c| c.account_id.as_str()).collect();
        accounts.sort_unstable();
        accounts.dedup();
        for account_id in accounts {
            self.notify_low_balance(registry, account_id);
        }
    }

    /// Write dirty wallets back to the ledger.
    pub fn flush(&self) -> Result<usize, LedgerError> {
        let wallets: Vec<Arc<Mutex<Wallet>>> = self.wallets.iter().map(|w| w.clone()).collect();
        let mut written = 0;
        for wallet in wallets {
            let pending = {
                let mut wallet = lock(&wallet);
                wallet
                    .take_dirty()
                    .then(|| (wallet.account_id.clone(), wallet.snapshot()))
            };
            if let Some((account_id, snapshot)) = pending {
                self.ledger.save_wallet(
                    &account_id,
                    snapshot.balance_mb,
                    snapshot.used_data_mb,
                    snapshot.last_deposit_at,
                    snapshot.exhausted_at,
                )?;
                written += 1;
            }
        }
        Ok(written)
    }
}

/// Run the idle billing sweep forever.
pub async fn run_sweeper(meter: Arc<CreditMeter>, registry: Arc<SessionRegistry>) {
    let period = Duration::from_secs(meter.config.sweep_interval_secs.max(1));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        meter.sweep(&registry);
    }
}

/// Periodically persist wallets.
pub async fn run_flusher(meter: Arc<CreditMeter>) {
    let period = Duration::from_secs(meter.config.flush_interval_secs.max(1));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match meter.flush() {
            Ok(0) => {}
            Ok(n) => tracing::debug!("Flushed {} wallets", n),
            Err(e) => tracing::error!("Failed to flush wallets: {}", e),
        }
    }
}
