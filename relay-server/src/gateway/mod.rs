//! Connection gateway.
//!
//! This module provides:
//! - WebSocket endpoint for trainer and simulator connections
//! - Handshake validation (API key, parameters, quotas)
//! - Region routing and one-shot redirects
//! - Session tokens for resuming after a socket loss

mod handshake;
pub mod region;
pub mod token;
mod ws;

pub use region::{RegionDecision, RegionRouter};
pub use token::{SessionClaims, TokenError, TokenIssuer};
pub use ws::ws_handler;
