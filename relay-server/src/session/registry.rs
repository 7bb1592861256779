//! Registry of connections, sessions and slot routes.
//!
//! Lock order is account lock, then session lock. The routes table is only
//! ever touched under a session lock, and the relay hot path reads it
//! without taking either.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use remoterl_common::{PairingUpdate, Role, ServerMessage, SlotId};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio::time::{timeout_at, Instant};

use super::pairing::{self, Candidate, PairingRequest, RoutingTable};
use super::{Connection, ConnectionId, ConnectionSpec, Session, SessionId, SessionSnapshot, SessionState};
use crate::error::RelayError;

/// Where frames for a slot go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub session_id: SessionId,
    pub trainer: ConnectionId,
    pub simulator: ConnectionId,
    /// Hosting simulator is parked; frames are dropped.
    pub suspended: bool,
}

#[derive(Clone)]
struct SessionEntry {
    account_id: String,
    session: Arc<Mutex<Session>>,
}

/// Registry of live connections and sessions.
pub struct SessionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    sessions: DashMap<SessionId, SessionEntry>,
    routes: DashMap<SlotId, Route>,
    account_locks: DashMap<String, Arc<Mutex<()>>>,
    capacity_signals: DashMap<String, Arc<Notify>>,
    next_seq: AtomicU64,
    next_slot: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            sessions: DashMap::new(),
            routes: DashMap::new(),
            account_locks: DashMap::new(),
            capacity_signals: DashMap::new(),
            next_seq: AtomicU64::new(1),
            next_slot: AtomicU64::new(1),
        }
    }

    /// Create and register a connection.
    pub fn register(&self, spec: ConnectionSpec) -> Arc<Connection> {
        let id = uuid::Uuid::new_v4().to_string();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let conn = Arc::new(Connection::new(id.clone(), seq, spec));
        self.connections.insert(id, conn.clone());
        tracing::info!(
            connection = %conn.id,
            role = %conn.role,
            account = %conn.account_id,
            "Connection registered"
        );
        conn
    }

    pub fn connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| c.clone())
    }

    pub fn remove_connection(&self, id: &str) {
        if self.connections.remove(id).is_some() {
            tracing::info!(connection = %id, "Connection removed");
        }
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| c.clone()).collect()
    }

    pub fn connections_for_account(&self, account_id: &str) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|c| c.account_id == account_id)
            .map(|c| c.clone())
            .collect()
    }

    /// Simulators of the account that have not terminated.
    pub fn simulator_count(&self, account_id: &str) -> usize {
        self.connections
            .iter()
            .filter(|c| {
                c.account_id == account_id
                    && c.role == Role::Simulator
                    && c.state() != super::ConnectionState::Terminated
            })
            .count()
    }

    pub fn route(&self, slot_id: SlotId) -> Option<Route> {
        self.routes.get(&slot_id).map(|r| r.clone())
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(session_id).map(|e| e.session.clone())
    }

    /// Current view of a session.
    pub async fn lookup(&self, session_id: &str) -> Option<SessionSnapshot> {
        let session = self.session(session_id)?;
        let guard = session.lock().await;
        Some(guard.snapshot())
    }

    pub async fn sessions_for_account(&self, account_id: &str) -> Vec<SessionSnapshot> {
        let mut out = Vec::new();
        for entry in self.account_sessions(account_id) {
            out.push(entry.lock().await.snapshot());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn account_sessions(&self, account_id: &str) -> Vec<Arc<Mutex<Session>>> {
        self.sessions
            .iter()
            .filter(|e| e.account_id == account_id)
            .map(|e| e.session.clone())
            .collect()
    }

    async fn lock_account(&self, account_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .account_locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    fn capacity_signal(&self, account_id: &str) -> Arc<Notify> {
        self.capacity_signals
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn allocate_slot(&self) -> SlotId {
        self.next_slot.fetch_add(1, Ordering::SeqCst)
    }

    /// Active simulators of the account, with their current load.
    fn candidates(&self, account_id: &str) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = self
            .connections
            .iter()
            .filter(|c| c.account_id == account_id && c.role == Role::Simulator && c.is_active())
            .map(|c| candidate(&c))
            .collect();
        candidates.sort_by_key(|c| c.seq);
        candidates
    }

    /// Open the session owned by a trainer connection.
    pub fn open_session(
        &self,
        trainer: &Connection,
        request: PairingRequest,
    ) -> Result<SessionId, RelayError> {
        let session_id = trainer
            .session_id
            .clone()
            .ok_or_else(|| RelayError::Internal("trainer connection without session".to_string()))?;

        if self.sessions.contains_key(&session_id) {
            return Err(RelayError::SessionDenied(format!(
                "session {} already has a trainer",
                session_id
            )));
        }

        let session = Session::new(
            session_id.clone(),
            trainer.account_id.clone(),
            trainer.id.clone(),
            request,
        );
        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                account_id: trainer.account_id.clone(),
                session: Arc::new(Mutex::new(session)),
            },
        );
        tracing::info!(
            session = %session_id,
            trainer = %trainer.id,
            workers = request.num_workers,
            runners = request.num_env_runners,
            "Session opened"
        );
        Ok(session_id)
    }

    /// Place a new session's runners, waiting up to `wait` for a simulator.
    pub async fn pair(&self, session_id: &str, wait: Duration) -> Result<(), RelayError> {
        let account_id = self
            .sessions
            .get(session_id)
            .map(|e| e.account_id.clone())
            .ok_or_else(|| RelayError::Internal(format!("unknown session {}", session_id)))?;
        let signal = self.capacity_signal(&account_id);
        let deadline = Instant::now() + wait;

        loop {
            let notified = signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_pair(session_id, &account_id).await? {
                return Ok(());
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Err(RelayError::MatchmakingFailed(wait));
            }
        }
    }

    /// One placement attempt. Returns false if no simulator could take anything.
    async fn try_pair(&self, session_id: &str, account_id: &str) -> Result<bool, RelayError> {
        let _account = self.lock_account(account_id).await;
        let session = self
            .session(session_id)
            .ok_or_else(|| RelayError::SessionDenied(format!("session {} closed", session_id)))?;
        let mut session = session.lock().await;
        if session.state != SessionState::Pairing {
            return Ok(true);
        }

        let candidates = self.candidates(account_id);
        let table = pairing::plan(&session.request, &candidates, || self.allocate_slot());
        if table.is_empty() {
            return Ok(false);
        }

        let old = std::mem::replace(&mut session.table, table);
        session.state = SessionState::Active;
        self.commit(&session, &old);
        tracing::info!(
            session = %session.id,
            slots = session.table.len(),
            simulators = session.simulators().len(),
            pending = session.table.pending().len(),
            "Session paired"
        );
        Ok(true)
    }

    /// A simulator became available. Wakes pairing waiters and fills pending
    /// runners of active sessions. Returns the sessions that gained slots.
    pub async fn offer_capacity(&self, account_id: &str) -> Vec<SessionId> {
        let _account = self.lock_account(account_id).await;
        self.capacity_signal(account_id).notify_waiters();
        self.fill_pending_locked(account_id).await
    }

    /// Attach one simulator to one session: the session's unplaced runners
    /// go to that simulator only. A session still waiting for its first
    /// simulator becomes active. Returns the number of runners placed.
    pub async fn attach_simulator(
        &self,
        session_id: &str,
        simulator: &Connection,
    ) -> Result<usize, RelayError> {
        if simulator.role != Role::Simulator || !simulator.is_active() {
            return Err(RelayError::SessionDenied(format!(
                "{} is not an active simulator",
                simulator.id
            )));
        }
        let _account = self.lock_account(&simulator.account_id).await;
        let session = self
            .sessions
            .get(session_id)
            .filter(|e| e.account_id == simulator.account_id)
            .map(|e| e.session.clone())
            .ok_or_else(|| RelayError::SessionDenied(format!("no session {} for this account", session_id)))?;
        let mut session = session.lock().await;

        let candidates = [candidate(simulator)];
        let old = session.table.clone();
        let placed = match session.state {
            SessionState::Pairing => {
                let table = pairing::plan(&session.request, &candidates, || self.allocate_slot());
                let placed = table.len();
                if placed > 0 {
                    session.table = table;
                    session.state = SessionState::Active;
                }
                placed
            }
            SessionState::Active => {
                pairing::fill_pending(&mut session.table, &candidates, || self.allocate_slot()).len()
            }
            SessionState::Closed => 0,
        };
        if placed > 0 {
            self.commit(&session, &old);
            tracing::info!(session = %session.id, simulator = %simulator.id, placed, "Simulator attached");
        }
        Ok(placed)
    }

    async fn fill_pending_locked(&self, account_id: &str) -> Vec<SessionId> {
        let mut changed = Vec::new();
        for session in self.account_sessions(account_id) {
            let mut session = session.lock().await;
            if session.state != SessionState::Active || session.table.pending().is_empty() {
                continue;
            }
            let old = session.table.clone();
            let candidates = self.candidates(account_id);
            let placed = pairing::fill_pending(&mut session.table, &candidates, || self.allocate_slot());
            if !placed.is_empty() {
                self.commit(&session, &old);
                tracing::info!(session = %session.id, placed = placed.len(), "Pending runners placed");
                changed.push(session.id.clone());
            }
        }
        changed
    }

    /// Suspend the slots of a parked simulator. Returns the sessions it serves.
    pub async fn suspend_simulator(&self, simulator: &Connection) -> Vec<SessionId> {
        self.set_suspended(simulator, true).await
    }

    /// Lift the suspension of a resumed simulator.
    pub async fn resume_simulator(&self, simulator: &Connection) -> Vec<SessionId> {
        self.set_suspended(simulator, false).await
    }

    async fn set_suspended(&self, simulator: &Connection, suspended: bool) -> Vec<SessionId> {
        let mut touched = Vec::new();
        for session_id in simulator.sessions() {
            let Some(session) = self.session(&session_id) else {
                continue;
            };
            let mut session = session.lock().await;
            let old = session.table.clone();
            if session.table.set_suspended(&simulator.id, suspended) > 0 {
                self.commit(&session, &old);
            }
            touched.push(session_id);
        }
        touched
    }

    /// Remove a terminated simulator and repair every session it served.
    ///
    /// Only the lost simulator's slots move. Returns the repaired sessions.
    pub async fn detach_simulator(&self, simulator: &Connection) -> Vec<SessionId> {
        let _account = self.lock_account(&simulator.account_id).await;
        self.remove_connection(&simulator.id);

        let mut touched = Vec::new();
        for session_id in simulator.sessions() {
            let Some(session) = self.session(&session_id) else {
                simulator.leave_session(&session_id);
                continue;
            };
            let mut session = session.lock().await;
            let old = session.table.clone();
            let candidates: Vec<Candidate> = self
                .candidates(&simulator.account_id)
                .into_iter()
                .filter(|c| c.connection_id != simulator.id)
                .collect();
            let repair = pairing::reassign(&mut session.table, &simulator.id, &candidates);
            self.commit(&session, &old);
            tracing::info!(
                session = %session_id,
                simulator = %simulator.id,
                moved = repair.moved.len(),
                orphaned = repair.orphaned.len(),
                "Session repaired after simulator loss"
            );
            touched.push(session_id);
        }
        touched
    }

    /// Tear down a session, freeing its slots. Capacity released here is
    /// offered to the account's other sessions.
    ///
    /// Returns the closed session's trainer and the sessions that gained slots,
    /// or `None` if the session was already gone.
    pub async fn close_session(&self, session_id: &str, reason: &str) -> Option<(ConnectionId, Vec<SessionId>)> {
        let entry = self.sessions.get(session_id).map(|e| e.clone())?;
        let _account = self.lock_account(&entry.account_id).await;
        self.sessions.remove(session_id)?;

        let trainer = {
            let mut session = entry.session.lock().await;
            session.disarm_cascade();
            session.state = SessionState::Closed;
            let old = std::mem::take(&mut session.table);
            self.commit(&session, &old);
            session.trainer.clone()
        };

        tracing::info!(session = %session_id, reason = %reason, "Session closed");
        let refilled = self.fill_pending_locked(&entry.account_id).await;
        Some((trainer, refilled))
    }

    /// Send every participant of a session its current view.
    pub async fn republish(&self, session_id: &str) {
        if let Some(session) = self.session(session_id) {
            let session = session.lock().await;
            self.publish_trainer(&session);
            for simulator in session.simulators() {
                self.publish_simulator(&session, &simulator);
            }
        }
    }

    /// Send a message to every connection taking part in a session, except `skip`.
    pub async fn broadcast(&self, session_id: &str, msg: &ServerMessage, skip: Option<&str>) {
        let Some(session) = self.session(session_id) else {
            return;
        };
        let participants: BTreeSet<ConnectionId> = {
            let session = session.lock().await;
            let mut set = session.simulators();
            set.insert(session.trainer.clone());
            set
        };
        for id in participants {
            if Some(id.as_str()) == skip {
                continue;
            }
            if let Some(conn) = self.connection(&id) {
                conn.send(msg.clone());
            }
        }
    }

    /// Apply the difference between `old` and the session's current table:
    /// loads, simulator membership, routes and pairing updates.
    fn commit(&self, session: &Session, old: &RoutingTable) {
        let new = &session.table;

        let old_loads = old.load_by_simulator();
        let new_loads = new.load_by_simulator();
        let affected: BTreeSet<&ConnectionId> = old_loads.keys().chain(new_loads.keys()).collect();
        for simulator in &affected {
            let before = old_loads.get(*simulator).copied().unwrap_or(0);
            let after = new_loads.get(*simulator).copied().unwrap_or(0);
            let Some(conn) = self.connection(simulator) else {
                continue;
            };
            if after > before {
                conn.add_load(after - before);
            } else if before > after {
                conn.sub_load(before - after);
            }
            if after > 0 {
                conn.join_session(&session.id);
            } else {
                conn.leave_session(&session.id);
            }
        }

        for slot in old.slots() {
            if new.get(slot.slot_id).is_none() {
                self.routes.remove(&slot.slot_id);
            }
        }
        for slot in new.slots() {
            self.routes.insert(
                slot.slot_id,
                Route {
                    session_id: session.id.clone(),
                    trainer: session.trainer.clone(),
                    simulator: slot.simulator.clone(),
                    suspended: slot.suspended,
                },
            );
        }

        if old != new && session.state != SessionState::Closed {
            self.publish_trainer(session);
        }
        for simulator in affected {
            if old.assignments_for(simulator) != new.assignments_for(simulator) {
                self.publish_simulator(session, simulator);
            }
        }
    }

    fn publish_trainer(&self, session: &Session) {
        if let Some(trainer) = self.connection(&session.trainer) {
            trainer.send(ServerMessage::PairingUpdate(PairingUpdate {
                session_id: session.id.clone(),
                slots: session.table.assignments(),
                pending_runners: session.table.pending().len() as u32,
            }));
        }
    }

    fn publish_simulator(&self, session: &Session, simulator: &str) {
        if let Some(conn) = self.connection(simulator) {
            conn.send(ServerMessage::PairingUpdate(PairingUpdate {
                session_id: session.id.clone(),
                slots: session.table.assignments_for(simulator),
                pending_runners: 0,
            }));
        }
    }
}

fn candidate(conn: &Connection) -> Candidate {
    Candidate {
        connection_id: conn.id.clone(),
        seq: conn.seq,
        load: conn.load(),
        capacity: conn.capacity,
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConnectionState, Outbound};
    use tokio::sync::mpsc;

    fn spec(role: Role, session_id: Option<&str>, capacity: u32) -> ConnectionSpec {
        ConnectionSpec {
            role,
            account_id: "acct".to_string(),
            region: "local".to_string(),
            session_id: session_id.map(str::to_string),
            capacity,
            framework: None,
        }
    }

    fn connect(
        registry: &SessionRegistry,
        spec: ConnectionSpec,
    ) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let conn = registry.register(spec);
        let (tx, rx) = mpsc::channel(64);
        conn.bind(tx);
        (conn, rx)
    }

    fn request(workers: u32, runners: u32) -> PairingRequest {
        PairingRequest {
            num_workers: workers,
            num_env_runners: runners,
        }
    }

    fn last_pairing(rx: &mut mpsc::Receiver<Outbound>) -> Option<PairingUpdate> {
        let mut last = None;
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Message(ServerMessage::PairingUpdate(update)) = item {
                last = Some(update);
            }
        }
        last
    }

    #[tokio::test]
    async fn test_pair_two_simulators_four_runners_each() {
        let registry = SessionRegistry::new();
        let (a, mut a_rx) = connect(&registry, spec(Role::Simulator, None, 32));
        let (b, _b_rx) = connect(&registry, spec(Role::Simulator, None, 32));
        let (trainer, mut t_rx) = connect(&registry, spec(Role::Trainer, Some("s1"), 0));

        let sid = registry.open_session(&trainer, request(2, 8)).unwrap();
        registry.pair(&sid, Duration::from_secs(1)).await.unwrap();

        assert_eq!(a.load(), 4);
        assert_eq!(b.load(), 4);
        let update = last_pairing(&mut t_rx).unwrap();
        assert_eq!(update.slots.len(), 8);
        let sim_update = last_pairing(&mut a_rx).unwrap();
        assert_eq!(sim_update.slots.len(), 4);
        assert!(sim_update.slots.iter().all(|s| s.simulator_id == a.id));

        let first = update.slots[0].slot_id;
        let route = registry.route(first).unwrap();
        assert_eq!(route.trainer, trainer.id);
        assert_eq!(route.session_id, sid);
    }

    #[tokio::test]
    async fn test_second_trainer_for_session_is_denied() {
        let registry = SessionRegistry::new();
        let (trainer, _rx) = connect(&registry, spec(Role::Trainer, Some("s1"), 0));
        let (other, _rx2) = connect(&registry, spec(Role::Trainer, Some("s1"), 0));

        registry.open_session(&trainer, request(1, 2)).unwrap();
        let err = registry.open_session(&other, request(1, 2)).unwrap_err();
        assert!(matches!(err, RelayError::SessionDenied(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_times_out_without_simulator() {
        let registry = SessionRegistry::new();
        let (trainer, _rx) = connect(&registry, spec(Role::Trainer, Some("s1"), 0));
        let sid = registry.open_session(&trainer, request(1, 2)).unwrap();

        let err = registry.pair(&sid, Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, RelayError::MatchmakingFailed(_)));
    }

    #[tokio::test]
    async fn test_pair_waits_for_simulator() {
        let registry = Arc::new(SessionRegistry::new());
        let (trainer, _rx) = connect(&registry, spec(Role::Trainer, Some("s1"), 0));
        let sid = registry.open_session(&trainer, request(1, 2)).unwrap();

        let waiter = {
            let registry = registry.clone();
            let sid = sid.clone();
            tokio::spawn(async move { registry.pair(&sid, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        let (sim, _sim_rx) = connect(&registry, spec(Role::Simulator, None, 32));
        registry.offer_capacity("acct").await;

        waiter.await.unwrap().unwrap();
        assert_eq!(sim.load(), 2);
    }

    #[tokio::test]
    async fn test_attach_simulator_to_one_session() {
        let registry = SessionRegistry::new();
        let (small, _s_rx) = connect(&registry, spec(Role::Simulator, None, 2));
        let (trainer, mut t_rx) = connect(&registry, spec(Role::Trainer, Some("s1"), 0));
        let sid = registry.open_session(&trainer, request(1, 4)).unwrap();

        assert_eq!(registry.attach_simulator(&sid, &small).await.unwrap(), 2);
        let update = last_pairing(&mut t_rx).unwrap();
        assert_eq!(update.slots.len(), 2);
        assert_eq!(update.pending_runners, 2);

        let (big, _b_rx) = connect(&registry, spec(Role::Simulator, None, 32));
        assert_eq!(registry.attach_simulator(&sid, &big).await.unwrap(), 2);
        assert_eq!(big.load(), 2);
        assert_eq!(registry.lookup(&sid).await.unwrap().slots.len(), 4);

        // nothing left to place
        assert_eq!(registry.attach_simulator(&sid, &big).await.unwrap(), 0);
        let err = registry.attach_simulator(&sid, &trainer).await.unwrap_err();
        assert!(matches!(err, RelayError::SessionDenied(_)));
        let err = registry.attach_simulator("missing", &big).await.unwrap_err();
        assert!(matches!(err, RelayError::SessionDenied(_)));
    }

    #[tokio::test]
    async fn test_detach_moves_only_lost_slots() {
        let registry = SessionRegistry::new();
        let (a, _a_rx) = connect(&registry, spec(Role::Simulator, None, 32));
        let (b, _b_rx) = connect(&registry, spec(Role::Simulator, None, 32));
        let (trainer, _t_rx) = connect(&registry, spec(Role::Trainer, Some("s1"), 0));
        let sid = registry.open_session(&trainer, request(2, 8)).unwrap();
        registry.pair(&sid, Duration::from_secs(1)).await.unwrap();

        let before = registry.lookup(&sid).await.unwrap();
        let on_a: Vec<_> = before
            .slots
            .iter()
            .filter(|s| s.simulator_id == a.id)
            .cloned()
            .collect();

        let (c, _c_rx) = connect(&registry, spec(Role::Simulator, None, 32));
        b.terminate();
        registry.detach_simulator(&b).await;

        let after = registry.lookup(&sid).await.unwrap();
        for slot in &on_a {
            assert!(after.slots.contains(slot));
        }
        assert_eq!(after.slots.len(), 8);
        assert!(after.slots.iter().all(|s| s.simulator_id != b.id));
        assert_eq!(c.load(), 4);
        assert!(registry.connection(&b.id).is_none());
    }

    #[tokio::test]
    async fn test_suspend_marks_routes() {
        let registry = SessionRegistry::new();
        let (sim, _s_rx) = connect(&registry, spec(Role::Simulator, None, 32));
        let (trainer, _t_rx) = connect(&registry, spec(Role::Trainer, Some("s1"), 0));
        let sid = registry.open_session(&trainer, request(1, 2)).unwrap();
        registry.pair(&sid, Duration::from_secs(1)).await.unwrap();
        let slot = registry.lookup(&sid).await.unwrap().slots[0].slot_id;

        sim.park(sim.generation());
        assert_eq!(registry.suspend_simulator(&sim).await, vec![sid.clone()]);
        assert!(registry.route(slot).unwrap().suspended);
        assert_eq!(sim.load(), 2);

        let (tx, _rx) = mpsc::channel(4);
        sim.bind(tx);
        registry.resume_simulator(&sim).await;
        assert!(!registry.route(slot).unwrap().suspended);
    }

    #[tokio::test]
    async fn test_close_session_frees_capacity_for_pending() {
        let registry = SessionRegistry::new();
        let (sim, mut sim_rx) = connect(&registry, spec(Role::Simulator, None, 2));
        let (t1, _t1_rx) = connect(&registry, spec(Role::Trainer, Some("s1"), 0));
        let (t2, _t2_rx) = connect(&registry, spec(Role::Trainer, Some("s2"), 0));

        registry.open_session(&t1, request(1, 2)).unwrap();
        registry.pair("s1", Duration::from_secs(1)).await.unwrap();

        // s2 gets nothing placed yet, so pairing would wait; seed it directly.
        registry.open_session(&t2, request(1, 1)).unwrap();
        {
            let session = registry.session("s2").unwrap();
            let mut session = session.lock().await;
            session.state = SessionState::Active;
            session.table = pairing::plan(&session.request, &[], || 0);
        }

        let (trainer, refilled) = registry.close_session("s1", "trainer left").await.unwrap();
        assert_eq!(trainer, t1.id);
        assert_eq!(refilled, vec!["s2".to_string()]);
        assert_eq!(sim.load(), 1);
        assert_eq!(sim.sessions(), vec!["s2".to_string()]);
        assert!(registry.session("s1").is_none());
        assert_eq!(sim.state(), ConnectionState::Active);

        // released from s1 with an empty update
        let mut saw_release = false;
        while let Ok(item) = sim_rx.try_recv() {
            if let Outbound::Message(ServerMessage::PairingUpdate(u)) = item {
                if u.session_id == "s1" && u.slots.is_empty() {
                    saw_release = true;
                }
            }
        }
        assert!(saw_release);
    }
}
