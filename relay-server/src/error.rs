//! Relay error type and its mapping onto caller-facing codes.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use remoterl_common::{ErrorCode, ErrorFamily, ErrorFrame};
use serde_json::json;

use crate::accounts::LedgerError;
use crate::gateway::token::TokenError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("API key is required")]
    MissingApiKey,
    #[error("API key is not recognised")]
    InvalidApiKey,
    #[error("API key has expired")]
    ExpiredApiKey,
    #[error("Account balance is exhausted")]
    CreditExhausted,
    #[error("Session denied: {0}")]
    SessionDenied(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Unknown framework '{0}'")]
    UnknownFramework(String),
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: u32, actual: u32 },

    #[error("No handshake received within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("No simulator became available within {0:?}")]
    MatchmakingFailed(Duration),
    #[error("Connection can no longer be resumed")]
    ReconnectFailed,
    #[error("Trainer did not return within the grace window")]
    TrainerTimeout,
    #[error("Simulator did not return within the grace window")]
    SimulatorTimeout,

    #[error("Simulator limit reached ({0})")]
    SimulatorLimit(u32),
    #[error("Requested {requested} workers, account allows {limit}")]
    WorkerLimit { requested: u32, limit: u32 },
    #[error("Requested {requested} env runners, account allows {limit}")]
    RunnerLimit { requested: u32, limit: u32 },

    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Account not found: {0}")]
    AccountNotFound(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::MissingApiKey => ErrorCode::AUTH_MISSING_KEY,
            RelayError::InvalidApiKey => ErrorCode::AUTH_INVALID_KEY,
            RelayError::ExpiredApiKey => ErrorCode::AUTH_EXPIRED_KEY,
            RelayError::CreditExhausted => ErrorCode::AUTH_CREDIT_EXHAUSTED,
            RelayError::SessionDenied(_) => ErrorCode::AUTH_SESSION_DENIED,
            RelayError::InvalidParameter(_) => ErrorCode::CFG_INVALID_PARAMETER,
            RelayError::UnknownFramework(_) => ErrorCode::CFG_UNKNOWN_FRAMEWORK,
            RelayError::ProtocolMismatch { .. } => ErrorCode::CFG_PROTOCOL_MISMATCH,
            RelayError::HandshakeTimeout(_) => ErrorCode::NET_HANDSHAKE_TIMEOUT,
            RelayError::MatchmakingFailed(_) => ErrorCode::NET_MATCHMAKING_FAILED,
            RelayError::ReconnectFailed => ErrorCode::NET_RECONNECT_FAILED,
            RelayError::TrainerTimeout => ErrorCode::NET_TRAINER_TIMEOUT,
            RelayError::SimulatorTimeout => ErrorCode::NET_SIMULATOR_TIMEOUT,
            RelayError::SimulatorLimit(_) => ErrorCode::QUO_SIMULATOR_LIMIT,
            RelayError::WorkerLimit { .. } => ErrorCode::QUO_WORKER_LIMIT,
            RelayError::RunnerLimit { .. } => ErrorCode::QUO_RUNNER_LIMIT,
            RelayError::Protocol(_) => ErrorCode::MISC_PROTOCOL,
            RelayError::AccountNotFound(_) => ErrorCode::AUTH_INVALID_KEY,
            RelayError::Ledger(_) | RelayError::Token(_) | RelayError::Internal(_) => {
                ErrorCode::MISC_INTERNAL
            }
        }
    }

    /// Short human-readable summary for the error frame.
    pub fn headline(&self) -> &'static str {
        match self {
            RelayError::MissingApiKey => "Missing API key",
            RelayError::InvalidApiKey | RelayError::AccountNotFound(_) => "Invalid API key",
            RelayError::ExpiredApiKey => "Expired API key",
            RelayError::CreditExhausted => "Credit exhausted",
            RelayError::SessionDenied(_) => "Session denied",
            RelayError::InvalidParameter(_) => "Invalid parameter",
            RelayError::UnknownFramework(_) => "Unknown framework",
            RelayError::ProtocolMismatch { .. } => "Protocol version mismatch",
            RelayError::HandshakeTimeout(_) => "Handshake timeout",
            RelayError::MatchmakingFailed(_) => "Matchmaking failed",
            RelayError::ReconnectFailed => "Reconnection failed",
            RelayError::TrainerTimeout => "Trainer timeout",
            RelayError::SimulatorTimeout => "Simulator timeout",
            RelayError::SimulatorLimit(_) => "Simulator limit reached",
            RelayError::WorkerLimit { .. } => "Worker limit exceeded",
            RelayError::RunnerLimit { .. } => "Env runner limit exceeded",
            RelayError::Protocol(_) => "Protocol error",
            RelayError::Ledger(_) | RelayError::Token(_) | RelayError::Internal(_) => {
                "Internal error"
            }
        }
    }

    pub fn to_frame(&self) -> ErrorFrame {
        ErrorFrame::new(self.code(), self.headline()).with_details(self.to_string())
    }

    fn status(&self) -> StatusCode {
        match self {
            RelayError::CreditExhausted => StatusCode::PAYMENT_REQUIRED,
            RelayError::AccountNotFound(_) => StatusCode::NOT_FOUND,
            _ => match self.code().family {
                ErrorFamily::Auth => StatusCode::UNAUTHORIZED,
                ErrorFamily::Cfg => StatusCode::BAD_REQUEST,
                ErrorFamily::Quo => StatusCode::TOO_MANY_REQUESTS,
                ErrorFamily::Net => StatusCode::SERVICE_UNAVAILABLE,
                ErrorFamily::Run | ErrorFamily::Misc => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        if matches!(self.code().family, ErrorFamily::Misc) {
            tracing::error!("Request failed: {}", self);
        }
        let frame = self.to_frame();
        let body = json!({
            "error": {
                "code": frame.code.to_string(),
                "headline": frame.headline,
                "details": frame.details,
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_errors_map_to_quo_family() {
        let err = RelayError::WorkerLimit {
            requested: 8,
            limit: 4,
        };
        assert_eq!(err.code(), ErrorCode::QUO_WORKER_LIMIT);
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_frame_carries_details() {
        let frame = RelayError::MatchmakingFailed(Duration::from_secs(30)).to_frame();
        assert_eq!(frame.code.to_string(), "NET-303");
        assert_eq!(frame.headline, "Matchmaking failed");
        assert!(frame.details.unwrap().contains("30s"));
    }

    #[test]
    fn test_protocol_mismatch_is_cfg() {
        let err = RelayError::ProtocolMismatch {
            expected: 1,
            actual: 2,
        };
        assert_eq!(err.code(), ErrorCode::CFG_PROTOCOL_MISMATCH);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
