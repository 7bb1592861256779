//! WebSocket protocol types for relay communication.
//!
//! This module defines the control message format exchanged between the relay
//! and its two classes of peers: trainers and simulators.
//!
//! # Protocol Overview
//!
//! Control frames are JSON text messages with a `type` field. Data frames are
//! binary messages: an 8-byte slot id followed by an opaque payload (see
//! [`crate::frame`]). The relay never looks past the slot id.
//!
//! ## Connection Flow
//!
//! 1. Client connects to the relay WebSocket endpoint
//! 2. Client sends `Handshake` with its API key, role and requested topology
//! 3. Relay responds with `HandshakeAck` (carrying a session token), a
//!    `Redirect` to a nearer region, or an `Error` frame followed by close
//! 4. Relay sends `PairingUpdate` whenever the slots a connection takes part
//!    in change
//! 5. Client sends periodic `Heartbeat`; relay answers with `Pong`
//! 6. After a socket loss the client reconnects and presents its session token
//!    in a new `Handshake` to resume
//!
//! # Security
//!
//! - Always use `wss://` in production to encrypt the connection
//! - Session tokens are bearer credentials for resuming; keep them private

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ErrorFrame;

/// Identifier of an env-runner slot. Unique across the relay process.
pub type SlotId = u64;

/// Protocol version constant.
pub const PROTOCOL_VERSION: u32 = 1;

/// Which side of the relay a connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Runs the learning loop; consumes observations, produces actions.
    Trainer,
    /// Hosts environment instances; consumes actions, produces observations.
    Simulator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Trainer => write!(f, "trainer"),
            Role::Simulator => write!(f, "simulator"),
        }
    }
}

/// RL frameworks a trainer may declare. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    Gymnasium,
    Rllib,
    StableBaselines3,
}

impl Framework {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gymnasium" | "gym" => Some(Framework::Gymnasium),
            "rllib" => Some(Framework::Rllib),
            "stable_baselines3" | "sb3" => Some(Framework::StableBaselines3),
            _ => None,
        }
    }
}

/// Messages sent from a client (trainer or simulator) to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on every socket.
    Handshake(Handshake),
    /// Periodic liveness signal.
    Heartbeat(Heartbeat),
    /// Failure inside the client's own process, passed through to peers.
    RunError(RunErrorReport),
    /// Clean shutdown; skips the reconnection grace window.
    Shutdown {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted.
    HandshakeAck(HandshakeAck),
    /// Connect to a nearer region instead. The socket is closed after this.
    Redirect { region: String, endpoint: String },
    /// Slot assignments changed.
    PairingUpdate(PairingUpdate),
    /// Reply to a heartbeat.
    Pong { timestamp: i64 },
    /// A peer lost its socket and is inside its grace window.
    PeerParked { connection_id: String, role: Role },
    /// A parked peer came back.
    PeerResumed { connection_id: String, role: Role },
    /// The account's balance is below one deposit; throughput is degraded.
    LowBalance { balance_mb: u64, used_data_mb: u64 },
    /// The session was torn down.
    SessionClosed { session_id: String, reason: String },
    /// Error frame. Handshake-time errors are followed by close.
    Error(ErrorFrame),
}

/// Handshake data sent on connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    /// Protocol version for compatibility checking.
    pub protocol_version: u32,
    /// Account API key.
    #[serde(default)]
    pub api_key: String,
    pub role: Role,
    /// Token issued by a previous `HandshakeAck`; present when resuming.
    #[serde(default)]
    pub session_token: Option<String>,
    /// Trainer only: number of local workers.
    #[serde(default = "default_num_workers")]
    pub num_workers: u32,
    /// Trainer only: number of remote env runners.
    #[serde(default = "default_num_env_runners")]
    pub num_env_runners: u32,
    /// Simulator only: most runners this simulator hosts across all trainers.
    #[serde(default = "default_max_env_runners")]
    pub max_env_runners: u32,
    /// Preferred region, used when the network origin is unknown.
    #[serde(default)]
    pub region_hint: Option<String>,
    /// Trainer only: framework the learning loop runs on.
    #[serde(default)]
    pub framework: Option<String>,
    /// Set by a client that is following a `Redirect`.
    #[serde(default)]
    pub redirected: bool,
}

fn default_num_workers() -> u32 {
    1
}

fn default_num_env_runners() -> u32 {
    2
}

fn default_max_env_runners() -> u32 {
    32
}

impl Handshake {
    pub fn trainer(api_key: impl Into<String>, num_workers: u32, num_env_runners: u32) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            api_key: api_key.into(),
            role: Role::Trainer,
            session_token: None,
            num_workers,
            num_env_runners,
            max_env_runners: default_max_env_runners(),
            region_hint: None,
            framework: None,
            redirected: false,
        }
    }

    pub fn simulator(api_key: impl Into<String>, max_env_runners: u32) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            api_key: api_key.into(),
            role: Role::Simulator,
            session_token: None,
            num_workers: default_num_workers(),
            num_env_runners: default_num_env_runners(),
            max_env_runners,
            region_hint: None,
            framework: None,
            redirected: false,
        }
    }
}

/// Handshake acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub connection_id: String,
    /// Trainer only.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Present this to resume after a disconnect.
    pub session_token: String,
    /// Region this connection is pinned to.
    pub region: String,
    /// True when an earlier connection's state was restored.
    pub resumed: bool,
    /// How often the client should send heartbeats.
    pub heartbeat_interval_secs: u64,
    /// How long the relay holds this connection after a socket loss.
    /// Zero when the relay did not say.
    #[serde(default)]
    pub grace_window_secs: u64,
}

/// Periodic heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Client clock, milliseconds since the epoch. Echoed in `Pong`.
    pub timestamp: i64,
    #[serde(default)]
    pub stats: Option<SimulatorStats>,
}

/// Stats snapshot reported by a simulator backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulatorStats {
    /// Simulation frames per second.
    pub fps: f64,
    /// Mean round-trip latency in milliseconds.
    pub latency_ms: f64,
    /// Total environment steps taken.
    pub steps: u64,
}

/// Kind of failure inside a trainer or simulator process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    Startup,
    Crash,
    EnvStep,
    EnvReset,
    EnvClose,
}

impl RunErrorKind {
    pub fn code(&self) -> crate::ErrorCode {
        use crate::ErrorCode;
        match self {
            RunErrorKind::Startup => ErrorCode::RUN_STARTUP_FAILED,
            RunErrorKind::Crash => ErrorCode::RUN_CRASHED,
            RunErrorKind::EnvStep => ErrorCode::RUN_ENV_STEP_FAILED,
            RunErrorKind::EnvReset => ErrorCode::RUN_ENV_RESET_FAILED,
            RunErrorKind::EnvClose => ErrorCode::RUN_ENV_CLOSE_FAILED,
        }
    }
}

/// Process failure report from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunErrorReport {
    pub kind: RunErrorKind,
    pub headline: String,
    #[serde(default)]
    pub details: Option<String>,
    /// Slot the failure concerns, if any.
    #[serde(default)]
    pub slot_id: Option<SlotId>,
}

impl RunErrorReport {
    pub fn to_frame(&self) -> ErrorFrame {
        let frame = ErrorFrame::new(self.kind.code(), self.headline.clone());
        match &self.details {
            Some(details) => frame.with_details(details.clone()),
            None => frame,
        }
    }
}

/// Slot assignments for one session, as seen by the receiving connection.
///
/// Trainers receive every slot of their session. Simulators receive only the
/// slots they host for that session; an empty list means the session released
/// the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingUpdate {
    pub session_id: String,
    pub slots: Vec<SlotAssignment>,
    /// Runners requested but not yet placed on any simulator.
    #[serde(default)]
    pub pending_runners: u32,
}

/// One env-runner slot binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAssignment {
    pub slot_id: SlotId,
    pub worker_index: u32,
    pub simulator_id: String,
    /// The hosting simulator is parked; frames for this slot are dropped.
    #[serde(default)]
    pub suspended: bool,
}
