//! Byte metering and account wallets.

pub mod meter;
mod wallet;

pub use meter::{Admission, CreditMeter, Throttle};
pub use wallet::{Debit, DepositWindow, Wallet, WalletSnapshot};
