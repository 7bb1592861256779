//! Account ledger: API keys, quotas, balances and presence.

pub mod keys;
mod ledger;

pub use keys::{generate_api_key, hash_api_key, is_well_formed};
pub use ledger::{Account, AccountLedger, AccountStatus, LedgerError, NewAccount, Quotas};
