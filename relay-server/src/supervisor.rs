//! Reconnection supervisor.
//!
//! A connection that loses its socket is parked, not torn down: its slots
//! stay reserved for the grace window. If it comes back with its session
//! token in time it resumes exactly where it was; otherwise it is terminated
//! and its slots are released (simulator) or its session is closed
//! (trainer). A session whose last serving simulator is parked gets its own
//! grace timer and is torn down if none returns.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use remoterl_common::{Role, ServerMessage};
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::session::{Connection, Outbound, SessionRegistry, SessionState};

/// Boxed so the terminate -> evaluate -> cascade -> terminate cycle has a
/// nameable `Send` future.
type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

pub struct ReconnectionSupervisor {
    registry: Arc<SessionRegistry>,
    grace: Duration,
}

impl ReconnectionSupervisor {
    pub fn new(registry: Arc<SessionRegistry>, grace: Duration) -> Self {
        Self { registry, grace }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Socket of `generation` is gone. Start the grace window.
    pub async fn park(self: &Arc<Self>, conn: &Arc<Connection>, generation: u64, cause: &str) {
        if !conn.park(generation) {
            return;
        }
        tracing::info!(
            connection = %conn.id,
            role = %conn.role,
            grace_secs = self.grace.as_secs(),
            "Connection parked: {}",
            cause
        );

        let timer = {
            let this = Arc::clone(self);
            let parked = Arc::clone(conn);
            tokio::spawn(async move {
                tokio::time::sleep(this.grace).await;
                this.expire(&parked, generation).await;
            })
        };
        conn.set_grace_timer(timer.abort_handle());

        let notice = ServerMessage::PeerParked {
            connection_id: conn.id.clone(),
            role: conn.role,
        };
        match conn.role {
            Role::Simulator => {
                for session_id in self.registry.suspend_simulator(conn).await {
                    self.registry.broadcast(&session_id, &notice, Some(&conn.id)).await;
                    self.evaluate(&session_id).await;
                }
            }
            Role::Trainer => {
                if let Some(session_id) = &conn.session_id {
                    self.registry.broadcast(session_id, &notice, Some(&conn.id)).await;
                }
            }
        }
    }

    /// Reattach a connection to a new socket. Returns the new generation,
    /// or `None` if it was terminated in the meantime.
    pub async fn resume(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        tx: mpsc::Sender<Outbound>,
    ) -> Option<u64> {
        let generation = conn.bind(tx)?;
        tracing::info!(connection = %conn.id, role = %conn.role, "Connection resumed");

        let notice = ServerMessage::PeerResumed {
            connection_id: conn.id.clone(),
            role: conn.role,
        };
        match conn.role {
            Role::Simulator => {
                for session_id in self.registry.resume_simulator(conn).await {
                    self.registry.broadcast(&session_id, &notice, Some(&conn.id)).await;
                    self.registry.republish(&session_id).await;
                    self.evaluate(&session_id).await;
                }
            }
            Role::Trainer => {
                if let Some(session_id) = &conn.session_id {
                    self.registry.broadcast(session_id, &notice, Some(&conn.id)).await;
                    self.registry.republish(session_id).await;
                }
            }
        }
        Some(generation)
    }

    async fn expire(self: &Arc<Self>, conn: &Arc<Connection>, generation: u64) {
        if !conn.grace_elapsed(generation) {
            return;
        }
        tracing::warn!(
            connection = %conn.id,
            role = %conn.role,
            "Grace window elapsed without reconnect"
        );
        let reason = match conn.role {
            Role::Trainer => RelayError::TrainerTimeout,
            Role::Simulator => RelayError::SimulatorTimeout,
        };
        self.terminate(conn, &reason.to_string()).await;
    }

    /// End a connection for good and release what it held.
    pub fn terminate<'a>(self: &'a Arc<Self>, conn: &'a Arc<Connection>, reason: &'a str) -> BoxFuture<'a> {
        Box::pin(async move {
            if !conn.terminate() {
                return;
            }
            tracing::info!(connection = %conn.id, role = %conn.role, "Connection terminated: {}", reason);

            match conn.role {
                Role::Trainer => {
                    self.registry.remove_connection(&conn.id);
                    if let Some(session_id) = &conn.session_id {
                        self.close_session(session_id, reason).await;
                    }
                }
                Role::Simulator => {
                    for session_id in self.registry.detach_simulator(conn).await {
                        self.evaluate(&session_id).await;
                    }
                }
            }
        })
    }

    async fn close_session(self: &Arc<Self>, session_id: &str, reason: &str) {
        let notice = ServerMessage::SessionClosed {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        };
        self.registry.broadcast(session_id, &notice, None).await;
        if let Some((_, refilled)) = self.registry.close_session(session_id, reason).await {
            for other in refilled {
                self.evaluate(&other).await;
            }
        }
    }

    /// Simulator capacity appeared for the account.
    pub async fn capacity_added(self: &Arc<Self>, account_id: &str) {
        for session_id in self.registry.offer_capacity(account_id).await {
            self.evaluate(&session_id).await;
        }
    }

    /// Arm or cancel the session teardown timer depending on whether any
    /// simulator is still serving it.
    pub fn evaluate<'a>(self: &'a Arc<Self>, session_id: &'a str) -> BoxFuture<'a> {
        Box::pin(async move {
            let Some(session) = self.registry.session(session_id) else {
                return;
            };
            let mut session = session.lock().await;
            if session.state != SessionState::Active {
                return;
            }

            if session.active_simulator_count() > 0 {
                if session.disarm_cascade() {
                    tracing::info!(session = %session_id, "Simulator serving again, teardown cancelled");
                }
                return;
            }
            if session.cascade_armed() {
                return;
            }

            tracing::info!(
                session = %session_id,
                grace_secs = self.grace.as_secs(),
                "No simulator serving session, teardown scheduled"
            );
            let timer = {
                let this = Arc::clone(self);
                let session_id = session_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(this.grace).await;
                    this.cascade(&session_id).await;
                })
            };
            session.arm_cascade(timer.abort_handle());
        })
    }

    async fn cascade(self: &Arc<Self>, session_id: &str) {
        let Some(session) = self.registry.session(session_id) else {
            return;
        };
        let trainer_id = {
            let mut session = session.lock().await;
            session.clear_cascade();
            if session.state != SessionState::Active || session.active_simulator_count() > 0 {
                return;
            }
            session.trainer.clone()
        };

        let err = RelayError::SimulatorTimeout;
        tracing::warn!(session = %session_id, trainer = %trainer_id, "Tearing down session: {}", err);
        match self.registry.connection(&trainer_id) {
            Some(trainer) => {
                trainer.send(ServerMessage::SessionClosed {
                    session_id: session_id.to_string(),
                    reason: err.to_string(),
                });
                trainer.close(Some(err.to_frame()));
                self.terminate(&trainer, &err.to_string()).await;
            }
            None => self.close_session(session_id, &err.to_string()).await,
        }
    }

    /// Run matchmaking for a new trainer. On failure the trainer gets a
    /// `NET` error frame and is closed.
    pub fn spawn_pairing(self: &Arc<Self>, trainer: Arc<Connection>, wait: Duration) {
        let Some(session_id) = trainer.session_id.clone() else {
            return;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.registry.pair(&session_id, wait).await {
                Ok(()) => this.evaluate(&session_id).await,
                Err(e) => {
                    tracing::warn!(session = %session_id, "Pairing failed: {}", e);
                    trainer.close(Some(e.to_frame()));
                    this.terminate(&trainer, &e.to_string()).await;
                }
            }
        });
    }
}
