//! Error types for the relay client.

use remoterl_common::ErrorFrame;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),

    /// The relay answered with an error frame.
    #[error("Relay refused: {0}")]
    Refused(ErrorFrame),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Connection closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An environment failed to reset, step or close.
    #[error("Environment error: {0}")]
    Environment(String),

    #[error("No API key: pass one, set REMOTERL_API_KEY, or save one in the local config")]
    MissingApiKey,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
