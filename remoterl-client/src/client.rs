//! WebSocket client for the relay.
//!
//! Handles the handshake (following at most one region redirect), heartbeats,
//! slot-addressed data frames and automatic resume with the issued session
//! token after a socket loss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use remoterl_common::{
    ClientMessage, DataFrame, ErrorFamily, ErrorFrame, Handshake, HandshakeAck, Heartbeat,
    PairingUpdate, Role, RunErrorReport, ServerMessage, SlotId,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::env::{CallLog, RemoteEnvironment};
use crate::error::{ClientError, Result};
use crate::hooks::HookRegistry;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Relay WebSocket URL, e.g. `wss://relay.example/ws`.
    pub url: String,
    pub handshake: Handshake,
    pub handshake_timeout: Duration,
    /// Delay before the first resume attempt; later attempts back off
    /// linearly up to `reconnect_max_delay`.
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// How long to keep trying to resume. `None` follows the grace window
    /// the relay advertised in its handshake ack.
    pub reconnect_window: Option<Duration>,
    /// How long a [`RemoteEnvironment`] waits for the simulator's reply.
    pub env_timeout: Duration,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>, handshake: Handshake) -> Self {
        Self {
            url: url.into(),
            handshake,
            handshake_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(10),
            reconnect_window: None,
            env_timeout: Duration::from_secs(60),
        }
    }

    /// Pause before resume attempt `attempt` (1-based).
    fn backoff(&self, attempt: u32) -> Duration {
        (self.reconnect_delay * attempt).min(self.reconnect_max_delay)
    }

    /// How long to keep trying to resume the connection `ack` describes.
    fn resume_window(&self, ack: &HandshakeAck) -> Duration {
        self.reconnect_window.unwrap_or(match ack.grace_window_secs {
            0 => DEFAULT_RESUME_WINDOW,
            secs => Duration::from_secs(secs),
        })
    }
}

/// Used when the relay does not advertise its grace window.
const DEFAULT_RESUME_WINDOW: Duration = Duration::from_secs(120);

/// Something the relay told us.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Handshake accepted, initially or after a resume.
    Connected(HandshakeAck),
    Pairing(PairingUpdate),
    /// Data frame for a slot with no [`RemoteEnvironment`] attached.
    Data { slot_id: SlotId, payload: Vec<u8> },
    PeerParked { connection_id: String, role: Role },
    PeerResumed { connection_id: String, role: Role },
    LowBalance { balance_mb: u64, used_data_mb: u64 },
    SessionClosed { session_id: String, reason: String },
    Error(ErrorFrame),
    /// The connection is gone for good. Always the last event.
    Disconnected,
}

pub(crate) enum Outgoing {
    Control(ClientMessage),
    Data(Vec<u8>),
}

/// Cloneable handle for sending on a client's connection.
#[derive(Clone)]
pub struct RelaySender {
    pub(crate) tx: mpsc::Sender<Outgoing>,
}

impl RelaySender {
    /// Send `payload` to the peer of `slot_id`. Waits while the outbound
    /// queue is full.
    pub async fn send_frame(&self, slot_id: SlotId, payload: &[u8]) -> Result<()> {
        self.send_encoded(DataFrame::encode(slot_id, payload)).await
    }

    pub(crate) async fn send_encoded(&self, frame: Vec<u8>) -> Result<()> {
        self.tx
            .send(Outgoing::Data(frame))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Pass a process failure on to the peers.
    pub async fn report_error(&self, report: RunErrorReport) -> Result<()> {
        self.control(ClientMessage::RunError(report)).await
    }

    async fn control(&self, msg: ClientMessage) -> Result<()> {
        self.tx
            .send(Outgoing::Control(msg))
            .await
            .map_err(|_| ClientError::Closed)
    }
}

type SlotInboxes = Arc<Mutex<HashMap<SlotId, mpsc::Sender<Vec<u8>>>>>;

pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// A trainer or simulator connection to the relay.
pub struct RelayClient {
    ack: HandshakeAck,
    sender: RelaySender,
    events: mpsc::Receiver<RelayEvent>,
    inboxes: SlotInboxes,
    calls: CallLog,
    env_timeout: Duration,
    task: JoinHandle<()>,
}

impl RelayClient {
    /// Connect and complete the handshake. Handshake-time refusals are
    /// returned as [`ClientError::Refused`].
    pub async fn connect(options: ClientOptions, hooks: Arc<HookRegistry>) -> Result<Self> {
        tracing::info!("Connecting to relay at {}", options.url);
        let (ws, ack, url) =
            open_socket(&options.url, &options.handshake, options.handshake_timeout).await?;
        tracing::info!(
            connection = %ack.connection_id,
            region = %ack.region,
            "Handshake acknowledged"
        );

        let (out_tx, out_rx) = mpsc::channel(64);
        let (event_tx, events) = mpsc::channel(1024);
        let inboxes = SlotInboxes::default();
        let calls = CallLog::default();
        let env_timeout = options.env_timeout;

        let link = Link {
            url,
            options,
            hooks,
            ack: ack.clone(),
            out_rx,
            event_tx,
            inboxes: inboxes.clone(),
            calls: calls.clone(),
            resend: false,
            unsent: None,
            terminal: false,
            last_error: None,
        };
        let task = tokio::spawn(link.run(ws));

        Ok(Self {
            ack,
            sender: RelaySender { tx: out_tx },
            events,
            inboxes,
            calls,
            env_timeout,
            task,
        })
    }

    /// The acknowledgment of the initial handshake.
    pub fn ack(&self) -> &HandshakeAck {
        &self.ack
    }

    pub fn connection_id(&self) -> &str {
        &self.ack.connection_id
    }

    /// Trainer only.
    pub fn session_id(&self) -> Option<&str> {
        self.ack.session_id.as_deref()
    }

    pub fn sender(&self) -> RelaySender {
        self.sender.clone()
    }

    pub async fn send_frame(&self, slot_id: SlotId, payload: &[u8]) -> Result<()> {
        self.sender.send_frame(slot_id, payload).await
    }

    pub async fn report_error(&self, report: RunErrorReport) -> Result<()> {
        self.sender.report_error(report).await
    }

    /// Next event, or `None` once the connection task has finished.
    pub async fn next_event(&mut self) -> Option<RelayEvent> {
        self.events.recv().await
    }

    /// Wait for the first pairing update that assigns slots. Other events
    /// received meanwhile are discarded.
    pub async fn wait_for_pairing(&mut self, wait: Duration) -> Result<PairingUpdate> {
        let deadline = Instant::now() + wait;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .map_err(|_| ClientError::Timeout("pairing"))?;
            match event {
                Some(RelayEvent::Pairing(update)) if !update.slots.is_empty() => return Ok(update),
                Some(RelayEvent::Error(frame)) if frame.code.family != ErrorFamily::Run => {
                    return Err(ClientError::Refused(frame))
                }
                Some(RelayEvent::Disconnected) | None => return Err(ClientError::Closed),
                Some(_) => {}
            }
        }
    }

    /// Environment proxy bound to `slot_id`. Data frames for the slot are
    /// delivered to it instead of the event stream.
    pub fn environment(&self, slot_id: SlotId) -> RemoteEnvironment {
        let (tx, rx) = mpsc::channel(16);
        lock(&self.inboxes).insert(slot_id, tx);
        RemoteEnvironment::new(
            slot_id,
            self.sender.clone(),
            rx,
            self.calls.clone(),
            self.env_timeout,
        )
    }

    /// Leave cleanly: the relay skips the grace window and releases
    /// everything this connection held.
    pub async fn shutdown(mut self, reason: Option<String>) -> Result<()> {
        let sent = self.sender.control(ClientMessage::Shutdown { reason }).await;
        if timeout(Duration::from_secs(5), &mut self.task).await.is_err() {
            self.task.abort();
        }
        sent
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Why one socket's pump ended.
enum Exit {
    Shutdown,
    Lost(String),
}

/// State of the background connection task.
struct Link {
    url: String,
    options: ClientOptions,
    hooks: Arc<HookRegistry>,
    ack: HandshakeAck,
    out_rx: mpsc::Receiver<Outgoing>,
    event_tx: mpsc::Sender<RelayEvent>,
    inboxes: SlotInboxes,
    calls: CallLog,
    /// Unanswered environment calls must be sent again: we or a peer just
    /// resumed.
    resend: bool,
    /// Control message whose write failed, sent first on the next socket.
    unsent: Option<ClientMessage>,
    /// The relay ended our session; resuming is pointless.
    terminal: bool,
    /// Most recent error frame, cleared by any other message.
    last_error: Option<ErrorFrame>,
}

impl Link {
    async fn run(mut self, mut ws: WsStream) {
        self.emit(RelayEvent::Connected(self.ack.clone()));
        loop {
            match self.pump(&mut ws).await {
                Exit::Shutdown => {
                    let _ = ws.close(None).await;
                    tracing::info!("Relay connection closed");
                    break;
                }
                Exit::Lost(cause) => {
                    if self.terminal || self.refused() {
                        tracing::info!("Relay ended the connection: {}", cause);
                        break;
                    }
                    tracing::warn!("Relay connection lost: {}", cause);
                    // answer a relay-side close so the relay parks us right away
                    let _ = timeout(Duration::from_secs(1), ws.close(None)).await;
                    match self.reconnect().await {
                        Some(new_ws) => {
                            ws = new_ws;
                            self.resend = true;
                            self.emit(RelayEvent::Connected(self.ack.clone()));
                        }
                        None => break,
                    }
                }
            }
        }
        self.emit(RelayEvent::Disconnected);
    }

    /// The last error frame means the relay will not take us back.
    fn refused(&self) -> bool {
        matches!(
            &self.last_error,
            Some(frame) if matches!(frame.code.family, ErrorFamily::Auth | ErrorFamily::Cfg | ErrorFamily::Quo)
        )
    }

    async fn pump(&mut self, ws: &mut WsStream) -> Exit {
        let period = Duration::from_secs(self.ack.heartbeat_interval_secs.max(1));
        let silence_limit = period * 3;
        let mut heartbeat = interval(period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_heard = Instant::now();

        if let Some(msg) = self.unsent.take() {
            if let Err(e) = send_json(ws, &msg).await {
                self.unsent = Some(msg);
                return Exit::Lost(e.to_string());
            }
            if matches!(msg, ClientMessage::Shutdown { .. }) {
                return Exit::Shutdown;
            }
        }
        if let Err(e) = self.resend_unanswered(ws).await {
            return Exit::Lost(e.to_string());
        }

        loop {
            tokio::select! {
                out = self.out_rx.recv() => match out {
                    Some(Outgoing::Control(msg)) => {
                        let shutdown = matches!(msg, ClientMessage::Shutdown { .. });
                        if let Err(e) = send_json(ws, &msg).await {
                            self.unsent = Some(msg);
                            return Exit::Lost(e.to_string());
                        }
                        if shutdown {
                            return Exit::Shutdown;
                        }
                    }
                    Some(Outgoing::Data(frame)) => {
                        if let Err(e) = ws.send(Message::Binary(frame)).await {
                            return Exit::Lost(e.to_string());
                        }
                    }
                    None => return Exit::Shutdown,
                },

                incoming = ws.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_heard = Instant::now();
                        self.handle_text(&text);
                        if let Err(e) = self.resend_unanswered(ws).await {
                            return Exit::Lost(e.to_string());
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_heard = Instant::now();
                        self.handle_data(&data).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return Exit::Lost("socket closed".to_string()),
                    Some(Ok(_)) => last_heard = Instant::now(),
                    Some(Err(e)) => return Exit::Lost(e.to_string()),
                },

                _ = heartbeat.tick() => {
                    if last_heard.elapsed() > silence_limit {
                        return Exit::Lost("relay stopped answering".to_string());
                    }
                    let msg = ClientMessage::Heartbeat(Heartbeat {
                        timestamp: now_millis(),
                        stats: self.hooks.stats(),
                    });
                    if let Err(e) = send_json(ws, &msg).await {
                        return Exit::Lost(e.to_string());
                    }
                }
            }
        }
    }

    /// Send the unanswered environment calls again if a resume asked for it.
    /// The simulator answers a repeated call from its last reply.
    async fn resend_unanswered(&mut self, ws: &mut WsStream) -> Result<()> {
        if !std::mem::take(&mut self.resend) {
            return Ok(());
        }
        for frame in self.calls.unanswered() {
            tracing::debug!("Re-sending unanswered environment call");
            ws.send(Message::Binary(frame)).await?;
        }
        Ok(())
    }

    fn handle_text(&mut self, text: &str) {
        let msg: ServerMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Unparseable message from relay: {}", e);
                return;
            }
        };
        if !matches!(msg, ServerMessage::Error(_)) {
            self.last_error = None;
        }

        let event = match msg {
            ServerMessage::PairingUpdate(update) => {
                tracing::debug!(
                    session = %update.session_id,
                    slots = update.slots.len(),
                    pending = update.pending_runners,
                    "Pairing update"
                );
                RelayEvent::Pairing(update)
            }
            ServerMessage::Pong { .. } => return,
            ServerMessage::PeerParked {
                connection_id,
                role,
            } => RelayEvent::PeerParked {
                connection_id,
                role,
            },
            ServerMessage::PeerResumed {
                connection_id,
                role,
            } => {
                self.resend = true;
                RelayEvent::PeerResumed {
                    connection_id,
                    role,
                }
            }
            ServerMessage::LowBalance {
                balance_mb,
                used_data_mb,
            } => {
                tracing::warn!(balance_mb, used_data_mb, "Account balance is low, throughput degraded");
                RelayEvent::LowBalance {
                    balance_mb,
                    used_data_mb,
                }
            }
            ServerMessage::SessionClosed { session_id, reason } => {
                if self.ack.session_id.as_deref() == Some(session_id.as_str()) {
                    self.terminal = true;
                }
                tracing::info!(session = %session_id, "Session closed: {}", reason);
                RelayEvent::SessionClosed { session_id, reason }
            }
            ServerMessage::Error(frame) => {
                tracing::warn!("Relay error: {}", frame);
                self.last_error = Some(frame.clone());
                RelayEvent::Error(frame)
            }
            ServerMessage::HandshakeAck(_) | ServerMessage::Redirect { .. } => {
                tracing::warn!("Unexpected handshake reply after handshake completed");
                return;
            }
        };
        self.emit(event);
    }

    async fn handle_data(&mut self, data: &[u8]) {
        let frame = match DataFrame::parse(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping data frame from relay: {}", e);
                return;
            }
        };
        let inbox = lock(&self.inboxes).get(&frame.slot_id).cloned();
        match inbox {
            Some(tx) => {
                if tx.send(frame.payload.to_vec()).await.is_err() {
                    lock(&self.inboxes).remove(&frame.slot_id);
                }
            }
            None => self.emit(RelayEvent::Data {
                slot_id: frame.slot_id,
                payload: frame.payload.to_vec(),
            }),
        }
    }

    fn emit(&self, event: RelayEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.event_tx.try_send(event) {
            tracing::warn!("Event queue full, dropping event");
        }
    }

    /// Resume with the session token, backing off between attempts, for as
    /// long as the relay holds the connection.
    async fn reconnect(&mut self) -> Option<WsStream> {
        let mut handshake = self.options.handshake.clone();
        handshake.session_token = Some(self.ack.session_token.clone());
        // stay in the region the connection is pinned to
        handshake.redirected = true;

        let window = self.options.resume_window(&self.ack);
        let deadline = Instant::now() + window;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let delay = self.options.backoff(attempt);
            if Instant::now() + delay >= deadline {
                break;
            }
            tokio::time::sleep(delay).await;
            tracing::info!("Resuming relay connection (attempt {})", attempt);
            match open_socket(&self.url, &handshake, self.options.handshake_timeout).await {
                Ok((ws, ack, _)) => {
                    if ack.resumed {
                        tracing::info!(connection = %ack.connection_id, "Connection resumed");
                    } else {
                        tracing::warn!(
                            connection = %ack.connection_id,
                            "Previous connection could not be resumed, started a new one"
                        );
                    }
                    self.ack = ack;
                    return Some(ws);
                }
                Err(ClientError::Refused(frame)) if !frame.code.family.is_retryable() => {
                    tracing::error!("Relay refused resume: {}", frame);
                    self.emit(RelayEvent::Error(frame));
                    return None;
                }
                Err(e) => tracing::warn!("Resume attempt {} failed: {}", attempt, e),
            }
        }
        tracing::error!(
            "Giving up on resume after {} attempts over {}s",
            attempt - 1,
            window.as_secs()
        );
        None
    }
}

/// Open a socket and complete the handshake, following one redirect.
/// Returns the URL that accepted the handshake.
async fn open_socket(
    url: &str,
    handshake: &Handshake,
    handshake_timeout: Duration,
) -> Result<(WsStream, HandshakeAck, String)> {
    let mut url = url.to_string();
    let mut handshake = handshake.clone();
    loop {
        let (mut ws, _) = connect_async(url.as_str()).await?;
        send_json(&mut ws, &ClientMessage::Handshake(handshake.clone())).await?;

        let reply = timeout(handshake_timeout, next_text(&mut ws))
            .await
            .map_err(|_| ClientError::HandshakeTimeout)??;
        match serde_json::from_str::<ServerMessage>(&reply)? {
            ServerMessage::HandshakeAck(ack) => return Ok((ws, ack, url)),
            ServerMessage::Redirect { region, endpoint } if !handshake.redirected => {
                tracing::info!("Redirected to region {} at {}", region, endpoint);
                let _ = ws.close(None).await;
                handshake.redirected = true;
                url = endpoint;
            }
            ServerMessage::Redirect { region, .. } => {
                return Err(ClientError::Protocol(format!(
                    "redirected twice (to {})",
                    region
                )))
            }
            ServerMessage::Error(frame) => return Err(ClientError::Refused(frame)),
            _ => return Err(ClientError::Protocol("unexpected reply to handshake".to_string())),
        }
    }
}

async fn next_text(ws: &mut WsStream) -> Result<String> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
            Some(Ok(_)) => return Err(ClientError::Protocol("expected text message".to_string())),
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn send_json<S>(sink: &mut S, msg: &ClientMessage) -> Result<()>
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(msg)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
