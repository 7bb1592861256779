use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use remoterl_common::{ErrorFrame, Framework, Role, ServerMessage, SimulatorStats};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;

use super::{ConnectionId, SessionId};
use crate::billing::DepositWindow;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Active,
    /// Socket lost; slots held until the grace window runs out.
    Parked,
    Terminated,
}

/// Items queued for a connection's socket writer.
#[derive(Debug)]
pub enum Outbound {
    Message(ServerMessage),
    Data(Vec<u8>),
    /// Send the error frame if any, then close the socket.
    Close(Option<ErrorFrame>),
}

/// Fixed attributes of a new connection.
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    pub role: Role,
    pub account_id: String,
    pub region: String,
    /// Set for trainers: the session they own.
    pub session_id: Option<SessionId>,
    /// Simulators: most runners hosted at once.
    pub capacity: u32,
    pub framework: Option<Framework>,
}

/// Ordered front of one socket's writer queue.
///
/// Control messages never wait: when the queue is full they go to an
/// overflow list drained in order by a single flush task. Data frames wait
/// until that list is empty, so nothing overtakes an earlier item.
#[derive(Debug, Clone)]
struct Writer {
    inner: Arc<WriterInner>,
}

#[derive(Debug)]
struct WriterInner {
    tx: mpsc::Sender<Outbound>,
    overflow: Mutex<Overflow>,
    drained: Notify,
}

#[derive(Debug, Default)]
struct Overflow {
    items: VecDeque<Outbound>,
    flushing: bool,
}

impl Writer {
    fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                tx,
                overflow: Mutex::new(Overflow::default()),
                drained: Notify::new(),
            }),
        }
    }

    /// Queue without waiting. Returns false if the writer is gone.
    fn push(&self, item: Outbound) -> bool {
        let mut overflow = lock(&self.inner.overflow);
        if overflow.flushing {
            overflow.items.push_back(item);
            return true;
        }
        match self.inner.tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(item)) => {
                overflow.items.push_back(item);
                overflow.flushing = true;
                tokio::spawn(self.clone().flush());
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn flush(self) {
        loop {
            let item = {
                let mut overflow = lock(&self.inner.overflow);
                match overflow.items.pop_front() {
                    Some(item) => item,
                    None => {
                        overflow.flushing = false;
                        break;
                    }
                }
            };
            if self.inner.tx.send(item).await.is_err() {
                let mut overflow = lock(&self.inner.overflow);
                overflow.items.clear();
                overflow.flushing = false;
                break;
            }
        }
        self.inner.drained.notify_waiters();
    }

    /// Queue a data frame behind any overflowed control messages, waiting
    /// while the queue is full.
    async fn send_data(&self, frame: Vec<u8>) -> bool {
        loop {
            let drained = self.inner.drained.notified();
            let flushing = lock(&self.inner.overflow).flushing;
            if !flushing {
                break;
            }
            drained.await;
        }
        self.inner.tx.send(Outbound::Data(frame)).await.is_ok()
    }
}

#[derive(Debug)]
struct Link {
    state: ConnectionState,
    writer: Option<Writer>,
    generation: u64,
    last_seen: DateTime<Utc>,
    parked_at: Option<DateTime<Utc>>,
    grace_timer: Option<AbortHandle>,
    stats: Option<SimulatorStats>,
    token: Option<String>,
}

/// A logical trainer or simulator connection.
///
/// Outlives any single socket: a parked connection has no writer but keeps
/// its id, session membership and slots until it resumes or expires. Each
/// socket binding gets a new generation so a superseded socket cannot park
/// its replacement.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    /// Registration order, used to break pairing ties.
    pub seq: u64,
    pub role: Role,
    pub account_id: String,
    /// Region the connection is pinned to for its lifetime.
    pub region: String,
    pub session_id: Option<SessionId>,
    pub capacity: u32,
    pub framework: Option<Framework>,
    pub connected_at: DateTime<Utc>,
    load: AtomicU32,
    link: Mutex<Link>,
    sessions: Mutex<BTreeSet<SessionId>>,
    window: Mutex<DepositWindow>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Connection {
    pub fn new(id: ConnectionId, seq: u64, spec: ConnectionSpec) -> Self {
        let now = Utc::now();
        Self {
            id,
            seq,
            role: spec.role,
            account_id: spec.account_id,
            region: spec.region,
            session_id: spec.session_id,
            capacity: spec.capacity,
            framework: spec.framework,
            connected_at: now,
            load: AtomicU32::new(0),
            link: Mutex::new(Link {
                state: ConnectionState::Active,
                writer: None,
                generation: 0,
                last_seen: now,
                parked_at: None,
                grace_timer: None,
                stats: None,
                token: None,
            }),
            sessions: Mutex::new(BTreeSet::new()),
            window: Mutex::new(DepositWindow::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.link).state
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn generation(&self) -> u64 {
        lock(&self.link).generation
    }

    /// Attach a socket writer. Cancels a pending grace timer.
    ///
    /// Returns the new generation, or `None` if the connection was terminated.
    pub fn bind(&self, tx: mpsc::Sender<Outbound>) -> Option<u64> {
        let mut link = lock(&self.link);
        if link.state == ConnectionState::Terminated {
            return None;
        }
        if let Some(timer) = link.grace_timer.take() {
            timer.abort();
        }
        link.state = ConnectionState::Active;
        link.writer = Some(Writer::new(tx));
        link.generation += 1;
        link.parked_at = None;
        link.last_seen = Utc::now();
        Some(link.generation)
    }

    /// Detach the writer of `generation`. Returns false if that socket was
    /// already replaced or the connection is not active.
    pub fn park(&self, generation: u64) -> bool {
        let mut link = lock(&self.link);
        if link.generation != generation || link.state != ConnectionState::Active {
            return false;
        }
        link.state = ConnectionState::Parked;
        link.writer = None;
        link.parked_at = Some(Utc::now());
        true
    }

    /// Mark terminated. Returns false if it already was.
    pub fn terminate(&self) -> bool {
        let mut link = lock(&self.link);
        if link.state == ConnectionState::Terminated {
            return false;
        }
        if let Some(timer) = link.grace_timer.take() {
            timer.abort();
        }
        link.state = ConnectionState::Terminated;
        link.writer = None;
        true
    }

    /// Called by the grace timer itself when it fires. Returns true if the
    /// connection is still parked from the same socket loss.
    pub fn grace_elapsed(&self, generation: u64) -> bool {
        let mut link = lock(&self.link);
        if link.state != ConnectionState::Parked || link.generation != generation {
            return false;
        }
        // the firing task must not abort itself on terminate
        link.grace_timer = None;
        true
    }

    /// Store the grace timer of the current parking.
    pub fn set_grace_timer(&self, timer: AbortHandle) {
        let mut link = lock(&self.link);
        if link.state != ConnectionState::Parked {
            timer.abort();
            return;
        }
        if let Some(old) = link.grace_timer.replace(timer) {
            old.abort();
        }
    }

    pub fn touch(&self, stats: Option<SimulatorStats>) {
        let mut link = lock(&self.link);
        link.last_seen = Utc::now();
        if stats.is_some() {
            link.stats = stats;
        }
    }

    pub fn set_token(&self, token: String) {
        lock(&self.link).token = Some(token);
    }

    pub fn token_matches(&self, token: &str) -> bool {
        lock(&self.link).token.as_deref() == Some(token)
    }

    fn writer(&self) -> Option<Writer> {
        lock(&self.link).writer.clone()
    }

    /// Queue a control message without waiting. Returns false if the
    /// connection has no socket.
    pub fn send(&self, msg: ServerMessage) -> bool {
        match self.writer() {
            Some(writer) => writer.push(Outbound::Message(msg)),
            None => false,
        }
    }

    /// Queue a data frame, waiting while the writer's queue is full.
    pub async fn send_data(&self, frame: Vec<u8>) -> bool {
        match self.writer() {
            Some(writer) => writer.send_data(frame).await,
            None => false,
        }
    }

    /// Ask the writer to send `frame` and close the socket.
    pub fn close(&self, frame: Option<ErrorFrame>) {
        if let Some(writer) = self.writer() {
            writer.push(Outbound::Close(frame));
        }
    }

    pub fn load(&self) -> u32 {
        self.load.load(Ordering::SeqCst)
    }

    pub fn add_load(&self, n: u32) {
        self.load.fetch_add(n, Ordering::SeqCst);
    }

    pub fn sub_load(&self, n: u32) {
        let _ = self
            .load
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |l| Some(l.saturating_sub(n)));
    }

    /// Sessions this simulator hosts slots for.
    pub fn sessions(&self) -> Vec<SessionId> {
        lock(&self.sessions).iter().cloned().collect()
    }

    pub fn join_session(&self, session_id: &str) {
        lock(&self.sessions).insert(session_id.to_string());
    }

    pub fn leave_session(&self, session_id: &str) {
        lock(&self.sessions).remove(session_id);
    }

    pub fn window(&self) -> MutexGuard<'_, DepositWindow> {
        lock(&self.window)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let link = lock(&self.link);
        ConnectionSnapshot {
            connection_id: self.id.clone(),
            role: self.role,
            state: link.state,
            region: self.region.clone(),
            session_id: self.session_id.clone(),
            connected_at: self.connected_at,
            last_seen: link.last_seen,
            parked_at: link.parked_at,
            load: self.load(),
            capacity: self.capacity,
            stats: link.stats,
        }
    }
}

/// Dashboard view of a connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub connection_id: ConnectionId,
    pub role: Role,
    pub state: ConnectionState,
    pub region: String,
    pub session_id: Option<SessionId>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub parked_at: Option<DateTime<Utc>>,
    pub load: u32,
    pub capacity: u32,
    pub stats: Option<SimulatorStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulator() -> Connection {
        Connection::new(
            "c1".to_string(),
            1,
            ConnectionSpec {
                role: Role::Simulator,
                account_id: "acct".to_string(),
                region: "local".to_string(),
                session_id: None,
                capacity: 4,
                framework: None,
            },
        )
    }

    #[tokio::test]
    async fn test_stale_generation_cannot_park() {
        let conn = simulator();
        let (tx1, _rx1) = mpsc::channel(4);
        let first = conn.bind(tx1).unwrap();
        let (tx2, _rx2) = mpsc::channel(4);
        let second = conn.bind(tx2).unwrap();

        assert!(!conn.park(first));
        assert!(conn.is_active());
        assert!(conn.park(second));
        assert_eq!(conn.state(), ConnectionState::Parked);
    }

    #[tokio::test]
    async fn test_terminated_cannot_rebind() {
        let conn = simulator();
        assert!(conn.terminate());
        assert!(!conn.terminate());
        let (tx, _rx) = mpsc::channel(4);
        assert!(conn.bind(tx).is_none());
    }

    #[tokio::test]
    async fn test_send_reaches_writer_queue() {
        let conn = simulator();
        assert!(!conn.send(ServerMessage::Pong { timestamp: 1 }));

        let (tx, mut rx) = mpsc::channel(4);
        conn.bind(tx);
        assert!(conn.send(ServerMessage::Pong { timestamp: 2 }));
        assert!(conn.send_data(vec![0; 9]).await);

        assert!(matches!(
            rx.recv().await,
            Some(Outbound::Message(ServerMessage::Pong { timestamp: 2 }))
        ));
        assert!(matches!(rx.recv().await, Some(Outbound::Data(d)) if d.len() == 9));
    }

    #[tokio::test]
    async fn test_full_queue_keeps_control_order() {
        let conn = Arc::new(simulator());
        let (tx, mut rx) = mpsc::channel(1);
        conn.bind(tx);
        assert!(conn.send_data(vec![0]).await);

        for timestamp in 1..=3 {
            assert!(conn.send(ServerMessage::Pong { timestamp }));
        }
        let late = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send_data(vec![9]).await })
        };
        conn.close(None);

        let mut order = Vec::new();
        for _ in 0..6 {
            order.push(match rx.recv().await {
                Some(Outbound::Data(d)) => format!("data{}", d[0]),
                Some(Outbound::Message(ServerMessage::Pong { timestamp })) => format!("pong{}", timestamp),
                Some(Outbound::Close(_)) => "close".to_string(),
                other => panic!("unexpected {:?}", other),
            });
        }
        assert!(late.await.unwrap());
        assert_eq!(order, vec!["data0", "pong1", "pong2", "pong3", "close", "data9"]);
    }

    #[test]
    fn test_load_never_underflows() {
        let conn = simulator();
        conn.add_load(2);
        conn.sub_load(5);
        assert_eq!(conn.load(), 0);
    }
}
