//! Relay transport: moves data frames between the two ends of a slot.
//!
//! The relay reads the slot id prefix and nothing else. Each source socket
//! is drained by one task and each destination has one FIFO writer, so
//! frames on a slot arrive in the order they were sent. A full destination
//! queue holds the source's reader, which is the only backpressure signal.

use std::sync::Arc;

use remoterl_common::{
    DataFrame, ErrorCode, ErrorFrame, Role, RunErrorReport, ServerMessage, SlotId,
};

use crate::billing::{Admission, CreditMeter};
use crate::error::RelayError;
use crate::session::{Connection, SessionRegistry};

/// Why a frame was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    UnknownSlot,
    /// Sender is not an end of that slot.
    NotParticipant,
    /// Hosting simulator is parked.
    Suspended,
    /// Destination has no socket right now.
    PeerUnavailable,
    CreditExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Delivered,
    Dropped(DropReason),
}

pub struct Relay {
    registry: Arc<SessionRegistry>,
    meter: Arc<CreditMeter>,
}

impl Relay {
    pub fn new(registry: Arc<SessionRegistry>, meter: Arc<CreditMeter>) -> Self {
        Self { registry, meter }
    }

    /// Forward one binary frame from `from` to the other end of its slot.
    pub async fn forward(&self, from: &Connection, frame: Vec<u8>) -> Forwarded {
        let slot_id = match DataFrame::peek_slot(&frame) {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!(connection = %from.id, "Dropping malformed frame: {}", e);
                from.send(ServerMessage::Error(
                    ErrorFrame::new(ErrorCode::MISC_PROTOCOL, "Malformed data frame")
                        .with_details(e.to_string()),
                ));
                return Forwarded::Dropped(DropReason::Malformed);
            }
        };

        let Some(route) = self.registry.route(slot_id) else {
            tracing::debug!(connection = %from.id, slot = slot_id, "Dropping frame for unknown slot");
            return Forwarded::Dropped(DropReason::UnknownSlot);
        };

        let destination = match from.role {
            Role::Trainer if route.trainer == from.id => &route.simulator,
            Role::Simulator if route.simulator == from.id => &route.trainer,
            _ => {
                tracing::warn!(connection = %from.id, slot = slot_id, "Frame for a slot the sender is not part of");
                return Forwarded::Dropped(DropReason::NotParticipant);
            }
        };

        if route.suspended {
            return self.drop_unreachable(from, slot_id, DropReason::Suspended);
        }

        let Some(destination) = self.registry.connection(destination) else {
            return self.drop_unreachable(from, slot_id, DropReason::PeerUnavailable);
        };
        if !destination.is_active() {
            return self.drop_unreachable(from, slot_id, DropReason::PeerUnavailable);
        }

        match self.meter.admit(&from.account_id) {
            Admission::Open => {}
            Admission::Throttled(throttle) => throttle.wait(frame.len()).await,
            Admission::Blocked => {
                from.send(ServerMessage::Error(RelayError::CreditExhausted.to_frame()));
                return Forwarded::Dropped(DropReason::CreditExhausted);
            }
        }

        let len = frame.len();
        if let Some(debit) = self.meter.charge(from, len) {
            if debit.newly_exhausted {
                self.meter.notify_low_balance(&self.registry, &from.account_id);
            }
        }

        if destination.send_data(frame).await {
            tracing::trace!(slot = slot_id, bytes = len, "Frame relayed");
            Forwarded::Delivered
        } else {
            self.drop_unreachable(from, slot_id, DropReason::PeerUnavailable)
        }
    }

    /// Tell the sender its frame was not delivered because the other end is
    /// between sockets. The client re-sends once that peer resumes.
    fn drop_unreachable(&self, from: &Connection, slot_id: SlotId, reason: DropReason) -> Forwarded {
        tracing::debug!(connection = %from.id, slot = slot_id, ?reason, "Peer unreachable, frame dropped");
        from.send(ServerMessage::Error(
            ErrorFrame::new(ErrorCode::NET_CONNECTION_LOST, "Peer unreachable, frame dropped")
                .with_details(format!("slot {}", slot_id)),
        ));
        Forwarded::Dropped(reason)
    }

    /// Pass a process failure report to the sender's peers.
    ///
    /// With a slot id only the other end of that slot hears about it;
    /// otherwise every peer in the sender's session(s) does.
    pub async fn pass_through(&self, from: &Connection, report: &RunErrorReport) {
        let msg = ServerMessage::Error(report.to_frame());
        tracing::info!(
            connection = %from.id,
            role = %from.role,
            code = %report.kind.code(),
            "Passing run error to peers: {}",
            report.headline
        );

        if let Some(route) = report.slot_id.and_then(|slot| self.registry.route(slot)) {
            let peer = match from.role {
                Role::Trainer if route.trainer == from.id => Some(&route.simulator),
                Role::Simulator if route.simulator == from.id => Some(&route.trainer),
                _ => None,
            };
            if let Some(peer) = peer.and_then(|id| self.registry.connection(id)) {
                peer.send(msg);
                return;
            }
        }

        match from.role {
            Role::Trainer => {
                if let Some(session_id) = &from.session_id {
                    self.registry.broadcast(session_id, &msg, Some(&from.id)).await;
                }
            }
            Role::Simulator => {
                for session_id in from.sessions() {
                    let Some(session) = self.registry.session(&session_id) else {
                        continue;
                    };
                    let trainer = session.lock().await.trainer.clone();
                    if let Some(trainer) = self.registry.connection(&trainer) {
                        trainer.send(msg.clone());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountLedger, NewAccount};
    use crate::config::BillingConfig;
    use crate::session::{ConnectionSpec, Outbound, PairingRequest};
    use remoterl_common::RunErrorKind;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: TempDir,
        registry: Arc<SessionRegistry>,
        meter: Arc<CreditMeter>,
        relay: Relay,
        account_id: String,
    }

    fn fixture(balance_mb: u64) -> Fixture {
        fixture_with(balance_mb, BillingConfig::default())
    }

    fn fixture_with(balance_mb: u64, billing: BillingConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("relay.db").display());
        let ledger = Arc::new(AccountLedger::new(&url).unwrap());
        let (account, _) = ledger
            .create_account(NewAccount {
                balance_mb,
                ..Default::default()
            })
            .unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let meter = Arc::new(CreditMeter::new(billing, ledger));
        meter.open_wallet(&account);
        let relay = Relay::new(registry.clone(), meter.clone());
        Fixture {
            _dir: dir,
            registry,
            meter,
            relay,
            account_id: account.id,
        }
    }

    fn connect(
        f: &Fixture,
        role: Role,
        session_id: Option<&str>,
    ) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let conn = f.registry.register(ConnectionSpec {
            role,
            account_id: f.account_id.clone(),
            region: "local".to_string(),
            session_id: session_id.map(str::to_string),
            capacity: 8,
            framework: None,
        });
        let (tx, rx) = mpsc::channel(64);
        conn.bind(tx);
        (conn, rx)
    }

    async fn paired(
        f: &Fixture,
    ) -> (
        Arc<Connection>,
        mpsc::Receiver<Outbound>,
        Arc<Connection>,
        mpsc::Receiver<Outbound>,
        u64,
    ) {
        let (sim, sim_rx) = connect(f, Role::Simulator, None);
        let (trainer, trainer_rx) = connect(f, Role::Trainer, Some("s1"));
        f.registry
            .open_session(
                &trainer,
                PairingRequest {
                    num_workers: 1,
                    num_env_runners: 1,
                },
            )
            .unwrap();
        f.registry.pair("s1", Duration::from_secs(1)).await.unwrap();
        let slot = f.registry.lookup("s1").await.unwrap().slots[0].slot_id;
        (trainer, trainer_rx, sim, sim_rx, slot)
    }

    fn next_data(rx: &mut mpsc::Receiver<Outbound>) -> Option<Vec<u8>> {
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Data(data) = item {
                return Some(data);
            }
        }
        None
    }

    #[tokio::test]
    async fn test_frames_forwarded_verbatim_both_ways() {
        let f = fixture(100);
        let (trainer, mut trainer_rx, sim, mut sim_rx, slot) = paired(&f).await;

        let action = DataFrame::encode(slot, b"action");
        assert_eq!(f.relay.forward(&trainer, action.clone()).await, Forwarded::Delivered);
        assert_eq!(next_data(&mut sim_rx), Some(action));

        let obs = DataFrame::encode(slot, b"observation");
        assert_eq!(f.relay.forward(&sim, obs.clone()).await, Forwarded::Delivered);
        assert_eq!(next_data(&mut trainer_rx), Some(obs));
    }

    #[tokio::test]
    async fn test_order_preserved_on_slot() {
        let f = fixture(100);
        let (trainer, _trainer_rx, _sim, mut sim_rx, slot) = paired(&f).await;

        for i in 0..20u8 {
            f.relay.forward(&trainer, DataFrame::encode(slot, &[i])).await;
        }
        for i in 0..20u8 {
            let frame = next_data(&mut sim_rx).unwrap();
            assert_eq!(DataFrame::parse(&frame).unwrap().payload, &[i]);
        }
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_frames_dropped() {
        let f = fixture(100);
        let (trainer, mut trainer_rx, _sim, _sim_rx, _slot) = paired(&f).await;

        assert_eq!(
            f.relay.forward(&trainer, DataFrame::encode(9999, b"x")).await,
            Forwarded::Dropped(DropReason::UnknownSlot)
        );
        assert_eq!(
            f.relay.forward(&trainer, vec![1, 2]).await,
            Forwarded::Dropped(DropReason::Malformed)
        );
        let mut saw_error = false;
        while let Ok(item) = trainer_rx.try_recv() {
            if let Outbound::Message(ServerMessage::Error(frame)) = item {
                assert_eq!(frame.code, ErrorCode::MISC_PROTOCOL);
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_outsider_cannot_use_slot() {
        let f = fixture(100);
        let (_trainer, _t_rx, _sim, _s_rx, slot) = paired(&f).await;
        let (outsider, _o_rx) = connect(&f, Role::Simulator, None);

        assert_eq!(
            f.relay.forward(&outsider, DataFrame::encode(slot, b"x")).await,
            Forwarded::Dropped(DropReason::NotParticipant)
        );
    }

    fn error_codes(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ErrorCode> {
        let mut codes = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Message(ServerMessage::Error(frame)) = item {
                codes.push(frame.code);
            }
        }
        codes
    }

    #[tokio::test]
    async fn test_suspended_slot_drops() {
        let f = fixture(100);
        let (trainer, mut t_rx, sim, _s_rx, slot) = paired(&f).await;
        sim.park(sim.generation());
        f.registry.suspend_simulator(&sim).await;
        error_codes(&mut t_rx);

        assert_eq!(
            f.relay.forward(&trainer, DataFrame::encode(slot, b"x")).await,
            Forwarded::Dropped(DropReason::Suspended)
        );
        assert_eq!(error_codes(&mut t_rx), vec![ErrorCode::NET_CONNECTION_LOST]);
    }

    #[tokio::test]
    async fn test_parked_trainer_drop_is_reported_to_simulator() {
        let f = fixture(100);
        let (trainer, _t_rx, sim, mut s_rx, slot) = paired(&f).await;
        trainer.park(trainer.generation());
        error_codes(&mut s_rx);

        assert_eq!(
            f.relay.forward(&sim, DataFrame::encode(slot, b"obs")).await,
            Forwarded::Dropped(DropReason::PeerUnavailable)
        );
        assert_eq!(error_codes(&mut s_rx), vec![ErrorCode::NET_CONNECTION_LOST]);
    }

    #[tokio::test]
    async fn test_billing_charged_to_sender() {
        let f = fixture(5);
        let (trainer, _t_rx, _sim, _s_rx, slot) = paired(&f).await;

        let burst = DataFrame::encode(slot, &vec![0u8; 2 * 1024 * 1024]);
        for _ in 0..5 {
            assert_eq!(f.relay.forward(&trainer, burst.clone()).await, Forwarded::Delivered);
        }
        let wallet = f.meter.snapshot(&f.account_id).unwrap();
        assert_eq!(wallet.balance_mb, 0);
        assert_eq!(wallet.used_data_mb, 5);
        assert!(matches!(f.meter.admit(&f.account_id), Admission::Throttled(_)));
    }

    #[tokio::test]
    async fn test_sixth_burst_is_throttled() {
        let billing = BillingConfig {
            throttled_kib_per_sec: 4096,
            throttled_burst_kib: 64,
            ..BillingConfig::default()
        };
        let f = fixture_with(5, billing);
        let (trainer, _t_rx, _sim, mut s_rx, slot) = paired(&f).await;
        let burst = DataFrame::encode(slot, &vec![0u8; 2 * 1024 * 1024]);

        for _ in 0..5 {
            assert_eq!(f.relay.forward(&trainer, burst.clone()).await, Forwarded::Delivered);
            next_data(&mut s_rx);
        }
        assert!(f.meter.is_exhausted(&f.account_id));

        // 2 MiB at 4 MiB/s less the 64 KiB burst
        let start = std::time::Instant::now();
        assert_eq!(f.relay.forward(&trainer, burst.clone()).await, Forwarded::Delivered);
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_run_error_reaches_slot_peer() {
        let f = fixture(100);
        let (_trainer, mut trainer_rx, sim, _s_rx, slot) = paired(&f).await;
        let report = RunErrorReport {
            kind: RunErrorKind::EnvStep,
            headline: "step raised".to_string(),
            details: None,
            slot_id: Some(slot),
        };

        f.relay.pass_through(&sim, &report).await;
        let mut code = None;
        while let Ok(item) = trainer_rx.try_recv() {
            if let Outbound::Message(ServerMessage::Error(frame)) = item {
                code = Some(frame.code);
            }
        }
        assert_eq!(code, Some(ErrorCode::RUN_ENV_STEP_FAILED));
    }
}
