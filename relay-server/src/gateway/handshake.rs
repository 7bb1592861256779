//! Handshake validation.
//!
//! Everything here runs before any session state exists, so a refused
//! handshake leaves nothing behind.

use std::sync::Arc;

use remoterl_common::{Framework, Handshake, Role, PROTOCOL_VERSION};

use super::token::TokenIssuer;
use crate::accounts::{self, Account, AccountLedger, AccountStatus, Quotas};
use crate::error::RelayError;
use crate::session::{Connection, ConnectionState, SessionRegistry};

/// Resolve the API key to an active account.
pub fn authenticate(ledger: &AccountLedger, api_key: &str) -> Result<Account, RelayError> {
    let api_key = api_key.trim();
    if api_key.is_empty() {
        return Err(RelayError::MissingApiKey);
    }
    if !accounts::is_well_formed(api_key) {
        return Err(RelayError::InvalidApiKey);
    }
    let account = ledger
        .find_by_api_key(api_key)?
        .ok_or(RelayError::InvalidApiKey)?;
    if account.status == AccountStatus::Expired {
        return Err(RelayError::ExpiredApiKey);
    }
    Ok(account)
}

/// Check the requested parameters. Returns the declared framework, if any.
pub fn validate_request(handshake: &Handshake) -> Result<Option<Framework>, RelayError> {
    if handshake.protocol_version != PROTOCOL_VERSION {
        return Err(RelayError::ProtocolMismatch {
            expected: PROTOCOL_VERSION,
            actual: handshake.protocol_version,
        });
    }

    match handshake.role {
        Role::Trainer => {
            if handshake.num_workers == 0 {
                return Err(RelayError::InvalidParameter(
                    "num_workers must be at least 1".to_string(),
                ));
            }
            if handshake.num_env_runners < handshake.num_workers {
                return Err(RelayError::InvalidParameter(format!(
                    "num_env_runners ({}) must be at least num_workers ({})",
                    handshake.num_env_runners, handshake.num_workers
                )));
            }
            match &handshake.framework {
                Some(name) => Framework::parse(name)
                    .map(Some)
                    .ok_or_else(|| RelayError::UnknownFramework(name.clone())),
                None => Ok(None),
            }
        }
        Role::Simulator => {
            if handshake.max_env_runners == 0 {
                return Err(RelayError::InvalidParameter(
                    "max_env_runners must be at least 1".to_string(),
                ));
            }
            Ok(None)
        }
    }
}

/// Per-account resource limits, checked before pairing.
pub fn check_quotas(
    handshake: &Handshake,
    quotas: &Quotas,
    simulators_online: usize,
) -> Result<(), RelayError> {
    match handshake.role {
        Role::Trainer => {
            if handshake.num_workers > quotas.max_workers {
                return Err(RelayError::WorkerLimit {
                    requested: handshake.num_workers,
                    limit: quotas.max_workers,
                });
            }
            if handshake.num_env_runners > quotas.max_env_runners {
                return Err(RelayError::RunnerLimit {
                    requested: handshake.num_env_runners,
                    limit: quotas.max_env_runners,
                });
            }
        }
        Role::Simulator => {
            if simulators_online >= quotas.max_simulators as usize {
                return Err(RelayError::SimulatorLimit(quotas.max_simulators));
            }
        }
    }
    Ok(())
}

/// The connection a session token resumes, if it still can be.
///
/// Any mismatch (bad signature, other account, other role, a connection
/// that is gone or was handed a newer token) means no resume.
pub fn resumable(
    registry: &SessionRegistry,
    tokens: &TokenIssuer,
    account: &Account,
    role: Role,
    token: &str,
) -> Option<Arc<Connection>> {
    let claims = match tokens.verify(token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::debug!("Session token rejected: {}", e);
            return None;
        }
    };
    if claims.acct != account.id || claims.role != role {
        return None;
    }
    let conn = registry.connection(&claims.sub)?;
    if conn.state() == ConnectionState::Terminated || !conn.token_matches(token) {
        return None;
    }
    Some(conn)
}
