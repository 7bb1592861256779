//! RemoteRL Common Types
//!
//! Shared types used by both the relay server and the trainer/simulator client.

pub mod error;
pub mod frame;
pub mod protocol;

pub use error::{ErrorCode, ErrorFamily, ErrorFrame};
pub use frame::{DataFrame, FrameError, DATA_HEADER_LEN};
pub use protocol::{
    ClientMessage, Framework, Handshake, HandshakeAck, Heartbeat, PairingUpdate, Role,
    RunErrorKind, RunErrorReport, ServerMessage, SimulatorStats, SlotAssignment, SlotId,
    PROTOCOL_VERSION,
};
