//! Sessions, connections and env-runner placement.

mod connection;
pub mod pairing;
mod registry;

pub use connection::{Connection, ConnectionSnapshot, ConnectionSpec, ConnectionState, Outbound};
pub use pairing::{Candidate, EnvRunnerSlot, PairingRequest, RoutingTable};
pub use registry::{Route, SessionRegistry};

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use remoterl_common::SlotAssignment;
use serde::Serialize;
use tokio::task::AbortHandle;

pub type ConnectionId = String;
pub type SessionId = String;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Waiting for the first simulator.
    Pairing,
    Active,
    Closed,
}

/// One trainer's run: the trainer, its requested topology and the slots
/// currently serving it.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub account_id: String,
    pub trainer: ConnectionId,
    pub request: PairingRequest,
    pub state: SessionState,
    pub table: RoutingTable,
    pub created_at: DateTime<Utc>,
    cascade_timer: Option<AbortHandle>,
}

impl Session {
    pub fn new(id: SessionId, account_id: String, trainer: ConnectionId, request: PairingRequest) -> Self {
        Self {
            id,
            account_id,
            trainer,
            request,
            state: SessionState::Pairing,
            table: RoutingTable::default(),
            created_at: Utc::now(),
            cascade_timer: None,
        }
    }

    pub fn simulators(&self) -> BTreeSet<ConnectionId> {
        self.table.simulators()
    }

    /// Number of simulators currently serving at least one unsuspended slot.
    pub fn active_simulator_count(&self) -> usize {
        self.table.active_simulators().len()
    }

    pub fn cascade_armed(&self) -> bool {
        self.cascade_timer.is_some()
    }

    /// Store the teardown timer started because no simulator is serving.
    pub fn arm_cascade(&mut self, timer: AbortHandle) {
        if let Some(old) = self.cascade_timer.replace(timer) {
            old.abort();
        }
    }

    /// Cancel the teardown timer. Returns true if one was running.
    pub fn disarm_cascade(&mut self) -> bool {
        match self.cascade_timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    /// Forget the teardown timer without aborting it. Used by the timer task.
    pub fn clear_cascade(&mut self) {
        self.cascade_timer = None;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            account_id: self.account_id.clone(),
            trainer: self.trainer.clone(),
            state: self.state,
            num_workers: self.request.num_workers,
            num_env_runners: self.request.num_env_runners,
            simulators: self.simulators().into_iter().collect(),
            slots: self.table.assignments(),
            pending_runners: self.table.pending().len() as u32,
            created_at: self.created_at,
        }
    }
}

/// Read-only view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub account_id: String,
    pub trainer: ConnectionId,
    pub state: SessionState,
    pub num_workers: u32,
    pub num_env_runners: u32,
    pub simulators: Vec<ConnectionId>,
    pub slots: Vec<SlotAssignment>,
    pub pending_runners: u32,
    pub created_at: DateTime<Utc>,
}
