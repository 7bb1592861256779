//! Environments over the relay.
//!
//! On the trainer side a [`RemoteEnvironment`] proxies reset/step/close calls
//! to the simulator that owns its slot. On the simulator side a
//! [`SimulatorHost`] keeps one local [`Environment`] per assigned slot and
//! answers those calls.
//!
//! Each call is one data frame: `[op][seq] ++ body`, with `seq` a big-endian
//! u32 numbering the calls on a slot. The reply echoes op and seq and adds a
//! status byte: `[op][seq][status] ++ body`, where a non-zero status means
//! the body is an error message. A call only accepts the reply carrying its
//! own seq, and the host answers a repeated seq from its last reply, so a
//! call re-sent after a resume runs once.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use remoterl_common::{
    DataFrame, PairingUpdate, RunErrorKind, RunErrorReport, SlotAssignment, SlotId,
};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use crate::client::{lock, RelayClient, RelayEvent, RelaySender};
use crate::error::{ClientError, Result};
use crate::hooks::HookRegistry;

/// A Gym-style environment with opaque, already-serialized payloads.
#[async_trait]
pub trait Environment: Send {
    async fn reset(&mut self, options: Vec<u8>) -> Result<Vec<u8>>;

    async fn step(&mut self, action: Vec<u8>) -> Result<Vec<u8>>;

    async fn close(&mut self) -> Result<()>;
}

/// Creates the local environment for a newly assigned slot.
#[async_trait]
pub trait EnvironmentFactory: Send + Sync {
    async fn create(&self, slot: &SlotAssignment) -> Result<Box<dyn Environment>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Op {
    Reset = 1,
    Step = 2,
    Close = 3,
}

impl Op {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Op::Reset),
            2 => Some(Op::Step),
            3 => Some(Op::Close),
            _ => None,
        }
    }

    fn error_kind(self) -> RunErrorKind {
        match self {
            Op::Reset => RunErrorKind::EnvReset,
            Op::Step => RunErrorKind::EnvStep,
            Op::Close => RunErrorKind::EnvClose,
        }
    }
}

const STATUS_OK: u8 = 0;
const STATUS_ERR: u8 = 1;

const SEQ_LEN: usize = 4;

fn encode_request(op: Op, seq: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + SEQ_LEN + body.len());
    buf.push(op as u8);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

fn decode_request(payload: &[u8]) -> std::result::Result<(Op, u32, &[u8]), String> {
    let Some((&op_byte, rest)) = payload.split_first() else {
        return Err("empty environment call".to_string());
    };
    let op = Op::from_byte(op_byte).ok_or_else(|| format!("unknown environment op {}", op_byte))?;
    if rest.len() < SEQ_LEN {
        return Err("truncated environment call".to_string());
    }
    let (seq, body) = rest.split_at(SEQ_LEN);
    let seq = u32::from_be_bytes([seq[0], seq[1], seq[2], seq[3]]);
    Ok((op, seq, body))
}

fn encode_reply(op: Op, seq: u32, result: std::result::Result<Vec<u8>, String>) -> Vec<u8> {
    let (status, body) = match result {
        Ok(body) => (STATUS_OK, body),
        Err(message) => (STATUS_ERR, message.into_bytes()),
    };
    let mut buf = Vec::with_capacity(2 + SEQ_LEN + body.len());
    buf.push(op as u8);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.push(status);
    buf.extend_from_slice(&body);
    buf
}

fn reply_seq(reply: &[u8]) -> Option<u32> {
    match reply {
        [_, a, b, c, d, ..] => Some(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => None,
    }
}

fn decode_reply(expected: Op, reply: &[u8]) -> Result<Vec<u8>> {
    let [op, _, _, _, _, status, body @ ..] = reply else {
        return Err(ClientError::Protocol("truncated environment reply".to_string()));
    };
    if *op != expected as u8 {
        return Err(ClientError::Protocol(format!(
            "reply for op {} while waiting for {:?}",
            op, expected
        )));
    }
    match *status {
        STATUS_OK => Ok(body.to_vec()),
        _ => Err(ClientError::Environment(
            String::from_utf8_lossy(body).into_owned(),
        )),
    }
}

/// Call numbering and in-flight requests of one client's environment
/// proxies. Shared with the connection task, which re-sends the unanswered
/// requests after a resume.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallLog {
    inner: Arc<Mutex<Calls>>,
}

#[derive(Debug, Default)]
struct Calls {
    next_seq: HashMap<SlotId, u32>,
    unanswered: BTreeMap<SlotId, Vec<u8>>,
}

impl CallLog {
    /// Number a new call on `slot_id` and hold its data frame until settled.
    fn begin(&self, slot_id: SlotId, op: Op, body: &[u8]) -> (u32, Vec<u8>) {
        let mut calls = lock(&self.inner);
        let next = calls.next_seq.entry(slot_id).or_insert(0);
        *next = next.wrapping_add(1);
        let seq = *next;
        let frame = DataFrame::encode(slot_id, &encode_request(op, seq, body));
        calls.unanswered.insert(slot_id, frame.clone());
        (seq, frame)
    }

    fn settle(&self, slot_id: SlotId) {
        lock(&self.inner).unanswered.remove(&slot_id);
    }

    /// Data frames of the calls still waiting for a reply.
    pub(crate) fn unanswered(&self) -> Vec<Vec<u8>> {
        lock(&self.inner).unanswered.values().cloned().collect()
    }
}

/// Trainer-side proxy for the environment behind one slot.
pub struct RemoteEnvironment {
    slot_id: SlotId,
    sender: RelaySender,
    inbox: mpsc::Receiver<Vec<u8>>,
    calls: CallLog,
    timeout: Duration,
}

impl RemoteEnvironment {
    pub(crate) fn new(
        slot_id: SlotId,
        sender: RelaySender,
        inbox: mpsc::Receiver<Vec<u8>>,
        calls: CallLog,
        timeout: Duration,
    ) -> Self {
        Self {
            slot_id,
            sender,
            inbox,
            calls,
            timeout,
        }
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    async fn call(&mut self, op: Op, body: &[u8]) -> Result<Vec<u8>> {
        let (seq, frame) = self.calls.begin(self.slot_id, op, body);
        let result = self.exchange(op, seq, frame).await;
        self.calls.settle(self.slot_id);
        result
    }

    async fn exchange(&mut self, op: Op, seq: u32, frame: Vec<u8>) -> Result<Vec<u8>> {
        self.sender.send_encoded(frame).await?;
        let deadline = Instant::now() + self.timeout;
        loop {
            let reply = timeout_at(deadline, self.inbox.recv())
                .await
                .map_err(|_| ClientError::Timeout("environment reply"))?
                .ok_or(ClientError::Closed)?;
            match reply_seq(&reply) {
                Some(got) if got == seq => return decode_reply(op, &reply),
                got => tracing::debug!(
                    slot = self.slot_id,
                    expected = seq,
                    ?got,
                    "Discarding stale environment reply"
                ),
            }
        }
    }
}

#[async_trait]
impl Environment for RemoteEnvironment {
    async fn reset(&mut self, options: Vec<u8>) -> Result<Vec<u8>> {
        self.call(Op::Reset, &options).await
    }

    async fn step(&mut self, action: Vec<u8>) -> Result<Vec<u8>> {
        self.call(Op::Step, &action).await
    }

    async fn close(&mut self) -> Result<()> {
        self.call(Op::Close, &[]).await.map(|_| ())
    }
}

/// Simulator-side runner: keeps an environment per assigned slot and answers
/// calls from the trainer.
pub struct SimulatorHost {
    factory: Arc<dyn EnvironmentFactory>,
    hooks: Arc<HookRegistry>,
    envs: HashMap<SlotId, Box<dyn Environment>>,
    /// Last answered call per slot, replayed when the trainer repeats it.
    replies: HashMap<SlotId, (u32, Vec<u8>)>,
    /// Slots held per session.
    sessions: HashMap<String, BTreeSet<SlotId>>,
}

impl SimulatorHost {
    pub fn new(factory: Arc<dyn EnvironmentFactory>, hooks: Arc<HookRegistry>) -> Self {
        Self {
            factory,
            hooks,
            envs: HashMap::new(),
            replies: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    /// Serve until the connection ends. All environments are closed on exit.
    pub async fn run(&mut self, client: &mut RelayClient) {
        let sender = client.sender();
        while let Some(event) = client.next_event().await {
            match event {
                RelayEvent::Pairing(update) => self.apply_pairing(&update, &sender).await,
                RelayEvent::Data { slot_id, payload } => {
                    if let Some(reply) = self.handle_frame(slot_id, &payload, &sender).await {
                        if let Err(e) = sender.send_frame(slot_id, &reply).await {
                            tracing::warn!(slot = slot_id, "Failed to send reply: {}", e);
                        }
                    }
                }
                RelayEvent::SessionClosed { session_id, .. } => {
                    self.release_session(&session_id).await
                }
                RelayEvent::Disconnected => break,
                _ => {}
            }
            self.hooks.poll();
        }

        let sessions: Vec<String> = self.sessions.keys().cloned().collect();
        for session_id in sessions {
            self.release_session(&session_id).await;
        }
    }

    /// Bring the environments for one session in line with `update`.
    pub async fn apply_pairing(&mut self, update: &PairingUpdate, sender: &RelaySender) {
        let wanted: BTreeSet<SlotId> = update.slots.iter().map(|s| s.slot_id).collect();
        let held = self
            .sessions
            .get(&update.session_id)
            .cloned()
            .unwrap_or_default();

        for slot_id in held.difference(&wanted) {
            self.close_env(*slot_id).await;
        }

        let mut kept = BTreeSet::new();
        for slot in &update.slots {
            if self.envs.contains_key(&slot.slot_id) {
                kept.insert(slot.slot_id);
                continue;
            }
            match self.factory.create(slot).await {
                Ok(env) => {
                    tracing::info!(
                        slot = slot.slot_id,
                        worker = slot.worker_index,
                        "Environment created"
                    );
                    self.envs.insert(slot.slot_id, env);
                    kept.insert(slot.slot_id);
                }
                Err(e) => {
                    tracing::error!(slot = slot.slot_id, "Environment creation failed: {}", e);
                    let report = RunErrorReport {
                        kind: RunErrorKind::Startup,
                        headline: "Environment creation failed".to_string(),
                        details: Some(e.to_string()),
                        slot_id: Some(slot.slot_id),
                    };
                    if let Err(e) = sender.report_error(report).await {
                        tracing::warn!("Failed to report startup error: {}", e);
                    }
                }
            }
        }

        if kept.is_empty() {
            self.sessions.remove(&update.session_id);
        } else {
            self.sessions.insert(update.session_id.clone(), kept);
        }
    }

    /// Run one call against the slot's environment and build the reply.
    /// Returns `None` for frames that cannot be answered.
    pub async fn handle_frame(
        &mut self,
        slot_id: SlotId,
        payload: &[u8],
        sender: &RelaySender,
    ) -> Option<Vec<u8>> {
        let (op, seq, body) = match decode_request(payload) {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(slot = slot_id, "Dropping environment call: {}", e);
                return None;
            }
        };
        if let Some((last, reply)) = self.replies.get(&slot_id) {
            if *last == seq {
                tracing::debug!(slot = slot_id, seq, "Repeated call, replaying reply");
                return Some(reply.clone());
            }
        }
        let Some(env) = self.envs.get_mut(&slot_id) else {
            return Some(encode_reply(op, seq, Err(format!("slot {} is not hosted here", slot_id))));
        };

        let result = match op {
            Op::Reset => env.reset(body.to_vec()).await,
            Op::Step => env.step(body.to_vec()).await,
            Op::Close => env.close().await.map(|_| Vec::new()),
        };
        let result = result.map_err(|e| e.to_string());

        if let Err(message) = &result {
            let report = RunErrorReport {
                kind: op.error_kind(),
                headline: format!("Environment {:?} failed", op).to_lowercase(),
                details: Some(message.clone()),
                slot_id: Some(slot_id),
            };
            if let Err(e) = sender.report_error(report).await {
                tracing::warn!("Failed to report environment error: {}", e);
            }
        }
        let reply = encode_reply(op, seq, result);
        self.replies.insert(slot_id, (seq, reply.clone()));
        Some(reply)
    }

    /// Close every environment held for `session_id`.
    pub async fn release_session(&mut self, session_id: &str) {
        let Some(slots) = self.sessions.remove(session_id) else {
            return;
        };
        for slot_id in slots {
            self.close_env(slot_id).await;
        }
        tracing::info!(session = %session_id, "Session released");
    }

    pub fn hosted_slots(&self) -> BTreeSet<SlotId> {
        self.envs.keys().copied().collect()
    }

    async fn close_env(&mut self, slot_id: SlotId) {
        self.replies.remove(&slot_id);
        if let Some(mut env) = self.envs.remove(&slot_id) {
            if let Err(e) = env.close().await {
                tracing::warn!(slot = slot_id, "Environment close failed: {}", e);
            }
        }
    }
}
