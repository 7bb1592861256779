//! Caller-facing error codes.
//!
//! Every error the relay surfaces belongs to a family and carries a stable
//! numeric sub-code. On the wire a code is rendered as `FAMILY-NNN`
//! (for example `NET-303`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error family. Each family owns one hundred-block of sub-codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorFamily {
    /// Missing/invalid/expired API key, exhausted credit, denied session.
    Auth,
    /// Invalid requested parameters.
    Cfg,
    /// Handshake, matchmaking, connection loss and timeouts.
    Net,
    /// Failures inside the trainer's or simulator's own process.
    Run,
    /// Per-account resource limits.
    Quo,
    /// Unclassified.
    Misc,
}

impl ErrorFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorFamily::Auth => "AUTH",
            ErrorFamily::Cfg => "CFG",
            ErrorFamily::Net => "NET",
            ErrorFamily::Run => "RUN",
            ErrorFamily::Quo => "QUO",
            ErrorFamily::Misc => "MISC",
        }
    }

    /// Whether a caller may retry the same request unchanged.
    ///
    /// CFG and QUO errors require the request to change; AUTH requires a
    /// different key or a top-up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorFamily::Net | ErrorFamily::Misc)
    }
}

impl FromStr for ErrorFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTH" => Ok(ErrorFamily::Auth),
            "CFG" => Ok(ErrorFamily::Cfg),
            "NET" => Ok(ErrorFamily::Net),
            "RUN" => Ok(ErrorFamily::Run),
            "QUO" => Ok(ErrorFamily::Quo),
            "MISC" => Ok(ErrorFamily::Misc),
            other => Err(format!("unknown error family '{}'", other)),
        }
    }
}

/// A family plus numeric sub-code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ErrorCode {
    pub family: ErrorFamily,
    pub number: u16,
}

impl ErrorCode {
    pub const fn new(family: ErrorFamily, number: u16) -> Self {
        Self { family, number }
    }

    pub const AUTH_MISSING_KEY: ErrorCode = ErrorCode::new(ErrorFamily::Auth, 101);
    pub const AUTH_INVALID_KEY: ErrorCode = ErrorCode::new(ErrorFamily::Auth, 102);
    pub const AUTH_EXPIRED_KEY: ErrorCode = ErrorCode::new(ErrorFamily::Auth, 103);
    pub const AUTH_CREDIT_EXHAUSTED: ErrorCode = ErrorCode::new(ErrorFamily::Auth, 104);
    pub const AUTH_SESSION_DENIED: ErrorCode = ErrorCode::new(ErrorFamily::Auth, 105);

    pub const CFG_INVALID_PARAMETER: ErrorCode = ErrorCode::new(ErrorFamily::Cfg, 201);
    pub const CFG_UNKNOWN_FRAMEWORK: ErrorCode = ErrorCode::new(ErrorFamily::Cfg, 202);
    pub const CFG_PROTOCOL_MISMATCH: ErrorCode = ErrorCode::new(ErrorFamily::Cfg, 203);

    pub const NET_HANDSHAKE_TIMEOUT: ErrorCode = ErrorCode::new(ErrorFamily::Net, 301);
    pub const NET_REDIRECT: ErrorCode = ErrorCode::new(ErrorFamily::Net, 302);
    pub const NET_MATCHMAKING_FAILED: ErrorCode = ErrorCode::new(ErrorFamily::Net, 303);
    pub const NET_CONNECTION_LOST: ErrorCode = ErrorCode::new(ErrorFamily::Net, 304);
    pub const NET_RECONNECT_FAILED: ErrorCode = ErrorCode::new(ErrorFamily::Net, 305);
    pub const NET_TRAINER_TIMEOUT: ErrorCode = ErrorCode::new(ErrorFamily::Net, 306);
    pub const NET_SIMULATOR_TIMEOUT: ErrorCode = ErrorCode::new(ErrorFamily::Net, 307);

    pub const RUN_STARTUP_FAILED: ErrorCode = ErrorCode::new(ErrorFamily::Run, 401);
    pub const RUN_CRASHED: ErrorCode = ErrorCode::new(ErrorFamily::Run, 402);
    pub const RUN_ENV_STEP_FAILED: ErrorCode = ErrorCode::new(ErrorFamily::Run, 403);
    pub const RUN_ENV_RESET_FAILED: ErrorCode = ErrorCode::new(ErrorFamily::Run, 404);
    pub const RUN_ENV_CLOSE_FAILED: ErrorCode = ErrorCode::new(ErrorFamily::Run, 405);

    pub const QUO_SIMULATOR_LIMIT: ErrorCode = ErrorCode::new(ErrorFamily::Quo, 501);
    pub const QUO_WORKER_LIMIT: ErrorCode = ErrorCode::new(ErrorFamily::Quo, 502);
    pub const QUO_RUNNER_LIMIT: ErrorCode = ErrorCode::new(ErrorFamily::Quo, 503);

    pub const MISC_INTERNAL: ErrorCode = ErrorCode::new(ErrorFamily::Misc, 901);
    pub const MISC_PROTOCOL: ErrorCode = ErrorCode::new(ErrorFamily::Misc, 902);
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:03}", self.family.as_str(), self.number)
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (family, number) = s
            .split_once('-')
            .ok_or_else(|| format!("malformed error code '{}'", s))?;
        let family = family.parse::<ErrorFamily>()?;
        let number = number
            .parse::<u16>()
            .map_err(|_| format!("malformed error number in '{}'", s))?;
        Ok(ErrorCode::new(family, number))
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.to_string()
    }
}

/// Error frame sent to a peer: `{code, headline, details}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub headline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorFrame {
    pub fn new(code: ErrorCode, headline: impl Into<String>) -> Self {
        Self {
            code,
            headline: headline.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ErrorFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) => write!(f, "[{}] {}: {}", self.code, self.headline, details),
            None => write!(f, "[{}] {}", self.code, self.headline),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::NET_MATCHMAKING_FAILED.to_string(), "NET-303");
        assert_eq!(ErrorCode::MISC_INTERNAL.to_string(), "MISC-901");
    }

    #[test]
    fn test_error_code_parse() {
        let code: ErrorCode = "QUO-502".parse().unwrap();
        assert_eq!(code, ErrorCode::QUO_WORKER_LIMIT);
        assert!("QUO502".parse::<ErrorCode>().is_err());
        assert!("XYZ-100".parse::<ErrorCode>().is_err());
    }

    #[test]
    fn test_error_frame_json_shape() {
        let frame = ErrorFrame::new(ErrorCode::AUTH_INVALID_KEY, "Invalid API key");
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"code":"AUTH-102","headline":"Invalid API key"}"#);

        let with_details = frame.with_details("key not recognised");
        let json = serde_json::to_string(&with_details).unwrap();
        assert!(json.contains(r#""details":"key not recognised""#));
    }

    #[test]
    fn test_family_retryable() {
        assert!(ErrorFamily::Net.is_retryable());
        assert!(!ErrorFamily::Cfg.is_retryable());
        assert!(!ErrorFamily::Quo.is_retryable());
        assert!(!ErrorFamily::Auth.is_retryable());
    }
}
