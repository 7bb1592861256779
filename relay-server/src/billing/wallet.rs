use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::accounts::Account;

/// In-memory balance of one account.
///
/// Balances are counted in whole deposits (1 MB each). The balance never
/// goes below zero; usage is always recorded so the ledger stays exact even
/// while an exhausted account is still being served.
#[derive(Debug, Clone)]
pub struct Wallet {
    pub account_id: String,
    pub balance_mb: u64,
    pub used_data_mb: u64,
    /// Deposits served while the balance was already zero.
    pub deficit_mb: u64,
    pub last_deposit_at: Option<DateTime<Utc>>,
    /// Wall-clock exhaustion time, persisted so a restart keeps the
    /// hard-stop delay running.
    exhausted_at: Option<DateTime<Utc>>,
    exhausted_since: Option<Instant>,
    dirty: bool,
}

/// Result of one debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Debit {
    /// This debit took the balance from positive to zero.
    pub newly_exhausted: bool,
}

impl Wallet {
    pub fn from_account(account: &Account) -> Self {
        let exhausted_at = match account.balance_mb {
            0 => Some(account.exhausted_at.unwrap_or_else(Utc::now)),
            _ => None,
        };
        Self {
            account_id: account.id.clone(),
            balance_mb: account.balance_mb,
            used_data_mb: account.used_data_mb,
            deficit_mb: 0,
            last_deposit_at: account.last_deposit_at,
            exhausted_at,
            exhausted_since: exhausted_at.map(instant_at),
            // an exhaustion first noticed now still has to reach the ledger
            dirty: exhausted_at.is_some() && account.exhausted_at.is_none(),
        }
    }

    /// Charge one deposit.
    pub fn debit(&mut self) -> Debit {
        self.used_data_mb += 1;
        self.last_deposit_at = Some(Utc::now());
        self.dirty = true;

        if self.balance_mb > 0 {
            self.balance_mb -= 1;
            if self.balance_mb == 0 {
                self.exhausted_at = Some(Utc::now());
                self.exhausted_since = Some(Instant::now());
                return Debit {
                    newly_exhausted: true,
                };
            }
        } else {
            self.deficit_mb += 1;
        }
        Debit {
            newly_exhausted: false,
        }
    }

    pub fn top_up(&mut self, mb: u64) {
        self.balance_mb += mb;
        if self.balance_mb > 0 {
            self.exhausted_at = None;
            self.exhausted_since = None;
            self.deficit_mb = 0;
        }
        self.dirty = true;
    }

    pub fn is_exhausted(&self) -> bool {
        self.balance_mb == 0
    }

    pub fn exhausted_since(&self) -> Option<Instant> {
        self.exhausted_since
    }

    /// Clear the dirty flag, returning whether it was set.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    pub fn snapshot(&self) -> WalletSnapshot {
        WalletSnapshot {
            balance_mb: self.balance_mb,
            used_data_mb: self.used_data_mb,
            deficit_mb: self.deficit_mb,
            exhausted: self.is_exhausted(),
            last_deposit_at: self.last_deposit_at,
            exhausted_at: self.exhausted_at,
        }
    }
}

/// Monotonic instant matching a past wall-clock time. Clamped to now when the
/// clock cannot reach back that far.
fn instant_at(at: DateTime<Utc>) -> Instant {
    let now = Instant::now();
    let ago = (Utc::now() - at).to_std().unwrap_or_default();
    now.checked_sub(ago).unwrap_or(now)
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletSnapshot {
    pub balance_mb: u64,
    pub used_data_mb: u64,
    pub deficit_mb: u64,
    pub exhausted: bool,
    pub last_deposit_at: Option<DateTime<Utc>>,
    pub exhausted_at: Option<DateTime<Utc>>,
}

/// Per-connection byte accumulator.
///
/// Every relayed message is charged at least the minimum charge. When the
/// accumulator would overflow the deposit size, one deposit is due and the
/// accumulator restarts from zero.
#[derive(Debug)]
pub struct DepositWindow {
    accumulated: u64,
    last_activity: Instant,
}

impl DepositWindow {
    pub fn new() -> Self {
        Self {
            accumulated: 0,
            last_activity: Instant::now(),
        }
    }

    /// Record a relayed message. Returns true when a deposit is due.
    pub fn record(&mut self, bytes: u64, min_charge: u64, deposit: u64) -> bool {
        let charge = bytes.max(min_charge);
        self.last_activity = Instant::now();
        if self.accumulated + charge > deposit {
            self.accumulated = 0;
            true
        } else {
            self.accumulated += charge;
            false
        }
    }

    /// Whether an idle deposit is due. Resets the idle clock when it is.
    pub fn idle_due(&mut self, now: Instant, interval: std::time::Duration) -> bool {
        if now.duration_since(self.last_activity) >= interval {
            self.last_activity = now;
            true
        } else {
            false
        }
    }

    pub fn accumulated(&self) -> u64 {
        self.accumulated
    }
}

impl Default for DepositWindow {
    fn default() -> Self {
        Self::new()
    }
}
