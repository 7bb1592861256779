use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::keys::{generate_api_key, hash_api_key};

/// Administrative standing of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Expired,
}

impl AccountStatus {
    fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Expired => "expired",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "expired" => AccountStatus::Expired,
            _ => AccountStatus::Active,
        }
    }
}

/// Per-account resource limits checked at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quotas {
    pub max_simulators: u32,
    pub max_workers: u32,
    pub max_env_runners: u32,
}

impl Default for Quotas {
    fn default() -> Self {
        Self {
            max_simulators: 8,
            max_workers: 32,
            max_env_runners: 256,
        }
    }
}

/// A billing account. One API key, one pool of credit.
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: String,
    pub label: Option<String>,
    pub status: AccountStatus,
    pub home_region: Option<String>,
    pub balance_mb: u64,
    pub used_data_mb: u64,
    pub quotas: Quotas,
    pub created_at: DateTime<Utc>,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_deposit_at: Option<DateTime<Utc>>,
    /// When the balance last ran out. Cleared by a top-up.
    pub exhausted_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn is_exhausted(&self) -> bool {
        self.balance_mb == 0
    }
}

/// Fields an operator supplies when creating an account.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewAccount {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub home_region: Option<String>,
    #[serde(default)]
    pub balance_mb: u64,
    #[serde(default)]
    pub quotas: Option<Quotas>,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("IO error: {0}")]
    IoError(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::DatabaseError(e.to_string())
    }
}

const ACCOUNT_COLUMNS: &str = "id, label, status, home_region, balance_mb, used_data_mb, \
     max_simulators, max_workers, max_env_runners, created_at, first_seen_at, last_deposit_at, exhausted_at";

/// SQLite-backed account ledger.
pub struct AccountLedger {
    conn: Mutex<Connection>,
}

impl AccountLedger {
    pub fn new(database_url: &str) -> Result<Self, LedgerError> {
        // Parse sqlite: prefix if present
        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| LedgerError::IoError(e.to_string()))?;
        }

        let conn = Connection::open(path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                api_key_hash TEXT NOT NULL UNIQUE,
                label TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                home_region TEXT,
                balance_mb INTEGER NOT NULL DEFAULT 0,
                used_data_mb INTEGER NOT NULL DEFAULT 0,
                max_simulators INTEGER NOT NULL,
                max_workers INTEGER NOT NULL,
                max_env_runners INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                first_seen_at TEXT,
                last_deposit_at TEXT,
                exhausted_at TEXT
            )",
            [],
        )?;

        // ledgers created before exhaustion times were kept
        let has_exhausted_at: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('accounts') WHERE name = 'exhausted_at'",
            [],
            |row| row.get(0),
        )?;
        if has_exhausted_at == 0 {
            conn.execute("ALTER TABLE accounts ADD COLUMN exhausted_at TEXT", [])?;
        }

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_accounts_api_key_hash ON accounts(api_key_hash)",
            [],
        )?;

        tracing::info!("Account ledger initialized with database: {}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|e| LedgerError::DatabaseError(e.to_string()))
    }

    /// Create an account. Returns the account and its plaintext API key.
    pub fn create_account(&self, new: NewAccount) -> Result<(Account, String), LedgerError> {
        let conn = self.lock()?;
        let api_key = generate_api_key();
        let id = uuid::Uuid::new_v4().to_string();
        let quotas = new.quotas.unwrap_or_default();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO accounts (id, api_key_hash, label, status, home_region, balance_mb,
                used_data_mb, max_simulators, max_workers, max_env_runners, created_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, 0, ?6, ?7, ?8, ?9)",
            params![
                id,
                hash_api_key(&api_key),
                new.label,
                new.home_region,
                new.balance_mb as i64,
                quotas.max_simulators,
                quotas.max_workers,
                quotas.max_env_runners,
                now.to_rfc3339(),
            ],
        )?;

        let account = Account {
            id,
            label: new.label,
            status: AccountStatus::Active,
            home_region: new.home_region,
            balance_mb: new.balance_mb,
            used_data_mb: 0,
            quotas,
            created_at: now,
            first_seen_at: None,
            last_deposit_at: None,
            exhausted_at: None,
        };
        Ok((account, api_key))
    }

    /// Look up the account owning an API key.
    pub fn find_by_api_key(&self, api_key: &str) -> Result<Option<Account>, LedgerError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM accounts WHERE api_key_hash = ?1", ACCOUNT_COLUMNS);
        let account = conn
            .query_row(&sql, params![hash_api_key(api_key)], account_from_row)
            .optional()?;
        Ok(account)
    }

    pub fn get(&self, id: &str) -> Result<Option<Account>, LedgerError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS);
        let account = conn.query_row(&sql, params![id], account_from_row).optional()?;
        Ok(account)
    }

    pub fn list(&self) -> Result<Vec<Account>, LedgerError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM accounts ORDER BY created_at", ACCOUNT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], account_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(LedgerError::from)
    }

    /// Returns false if no such account exists.
    pub fn set_status(&self, id: &str, status: AccountStatus) -> Result<bool, LedgerError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE accounts SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(changed > 0)
    }

    /// Stamp the account's first connection. Returns true only the first time.
    pub fn record_presence(&self, id: &str) -> Result<bool, LedgerError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE accounts SET first_seen_at = ?1 WHERE id = ?2 AND first_seen_at IS NULL",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(changed > 0)
    }

    /// Write back the in-memory wallet figures.
    pub fn save_wallet(
        &self,
        id: &str,
        balance_mb: u64,
        used_data_mb: u64,
        last_deposit_at: Option<DateTime<Utc>>,
        exhausted_at: Option<DateTime<Utc>>,
    ) -> Result<(), LedgerError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE accounts SET balance_mb = ?1, used_data_mb = ?2,
                last_deposit_at = COALESCE(?3, last_deposit_at), exhausted_at = ?4
             WHERE id = ?5",
            params![
                balance_mb as i64,
                used_data_mb as i64,
                last_deposit_at.map(|t| t.to_rfc3339()),
                exhausted_at.map(|t| t.to_rfc3339()),
                id
            ],
        )?;
        Ok(())
    }
}

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let status: String = row.get(2)?;
    let created_at: String = row.get(9)?;
    Ok(Account {
        id: row.get(0)?,
        label: row.get(1)?,
        status: AccountStatus::parse(&status),
        home_region: row.get(3)?,
        balance_mb: row.get::<_, i64>(4)?.max(0) as u64,
        used_data_mb: row.get::<_, i64>(5)?.max(0) as u64,
        quotas: Quotas {
            max_simulators: row.get(6)?,
            max_workers: row.get(7)?,
            max_env_runners: row.get(8)?,
        },
        created_at: parse_time(Some(created_at)).unwrap_or_else(Utc::now),
        first_seen_at: parse_time(row.get(10)?),
        last_deposit_at: parse_time(row.get(11)?),
        exhausted_at: parse_time(row.get(12)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger() -> (TempDir, AccountLedger) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("ledger.db").display());
        let ledger = AccountLedger::new(&url).unwrap();
        (dir, ledger)
    }

    #[test]
    fn test_create_and_find_by_key() {
        let (_dir, ledger) = ledger();
        let (account, key) = ledger
            .create_account(NewAccount {
                label: Some("lab".to_string()),
                balance_mb: 50,
                ..Default::default()
            })
            .unwrap();

        let found = ledger.find_by_api_key(&key).unwrap().unwrap();
        assert_eq!(found.id, account.id);
        assert_eq!(found.balance_mb, 50);
        assert_eq!(found.status, AccountStatus::Active);
        assert_eq!(found.quotas, Quotas::default());
        assert!(ledger.find_by_api_key("rrl_nope").unwrap().is_none());
    }

    #[test]
    fn test_record_presence_only_once() {
        let (_dir, ledger) = ledger();
        let (account, _) = ledger.create_account(NewAccount::default()).unwrap();

        assert!(ledger.record_presence(&account.id).unwrap());
        assert!(!ledger.record_presence(&account.id).unwrap());
        assert!(ledger.get(&account.id).unwrap().unwrap().first_seen_at.is_some());
    }

    #[test]
    fn test_save_wallet_and_status() {
        let (_dir, ledger) = ledger();
        let (account, _) = ledger.create_account(NewAccount::default()).unwrap();

        ledger.save_wallet(&account.id, 3, 17, Some(Utc::now()), None).unwrap();
        assert!(ledger.set_status(&account.id, AccountStatus::Expired).unwrap());
        assert!(!ledger.set_status("missing", AccountStatus::Expired).unwrap());

        let stored = ledger.get(&account.id).unwrap().unwrap();
        assert_eq!(stored.balance_mb, 3);
        assert_eq!(stored.used_data_mb, 17);
        assert_eq!(stored.status, AccountStatus::Expired);
        assert!(stored.last_deposit_at.is_some());
        assert_eq!(ledger.list().unwrap().len(), 1);
    }

    #[test]
    fn test_exhaustion_time_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("ledger.db").display());
        let exhausted_at = Utc::now() - chrono::Duration::minutes(20);

        let id = {
            let ledger = AccountLedger::new(&url).unwrap();
            let (account, _) = ledger.create_account(NewAccount::default()).unwrap();
            ledger.save_wallet(&account.id, 0, 5, None, Some(exhausted_at)).unwrap();
            account.id
        };

        let reopened = AccountLedger::new(&url).unwrap();
        let stored = reopened.get(&id).unwrap().unwrap();
        assert_eq!(
            stored.exhausted_at.map(|t| t.timestamp()),
            Some(exhausted_at.timestamp())
        );

        reopened.save_wallet(&id, 4, 5, None, None).unwrap();
        assert!(reopened.get(&id).unwrap().unwrap().exhausted_at.is_none());
    }
}
