//! WebSocket handler for trainer and simulator connections.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use remoterl_common::{
    ClientMessage, Framework, Handshake, HandshakeAck, Role, ServerMessage,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use super::handshake::{authenticate, check_quotas, resumable, validate_request};
use super::region::RegionDecision;
use crate::accounts::Account;
use crate::billing::Admission;
use crate::error::RelayError;
use crate::session::{Connection, ConnectionSpec, Outbound, PairingRequest};
use crate::AppState;

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if state.config.relay.require_tls && !forwarded_https(&headers) {
        tracing::warn!("Refusing plaintext upgrade from {}", addr);
        return (StatusCode::FORBIDDEN, "TLS required").into_response();
    }
    let origin = forwarded_for(&headers).unwrap_or(addr.ip());
    tracing::debug!("Connection attempt from {} (origin {})", addr, origin);
    ws.on_upgrade(move |socket| handle_socket(socket, state, origin))
}

fn forwarded_https(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("https") || v.eq_ignore_ascii_case("wss"))
        .unwrap_or(false)
}

/// First address of `X-Forwarded-For`, as set by the TLS terminator.
fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// How an accepted handshake proceeds.
enum Entry {
    Resume(Arc<Connection>),
    Fresh {
        account: Account,
        framework: Option<Framework>,
        region: String,
    },
    Redirect {
        region: String,
        endpoint: String,
    },
}

type WsSink = SplitSink<WebSocket, Message>;

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, origin: IpAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let handshake_timeout = state.config.relay.handshake_timeout();
    let handshake = match timeout(handshake_timeout, ws_rx.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Handshake(handshake)) => handshake,
            Ok(_) => {
                tracing::warn!("Expected Handshake message from {}, got different type", origin);
                let err = RelayError::Protocol("Expected handshake".to_string());
                refuse(&mut ws_tx, &err).await;
                return;
            }
            Err(e) => {
                tracing::warn!("Failed to parse handshake from {}: {}", origin, e);
                refuse(&mut ws_tx, &RelayError::Protocol(e.to_string())).await;
                return;
            }
        },
        Ok(Some(Ok(_))) => {
            tracing::warn!("Expected text message for handshake from {}", origin);
            let err = RelayError::Protocol("Expected text handshake".to_string());
            refuse(&mut ws_tx, &err).await;
            return;
        }
        Ok(Some(Err(e))) => {
            tracing::warn!("WebSocket error during handshake from {}: {}", origin, e);
            return;
        }
        Ok(None) => {
            tracing::info!("Connection closed before handshake from {}", origin);
            return;
        }
        Err(_) => {
            tracing::warn!("Handshake timeout from {}", origin);
            refuse(&mut ws_tx, &RelayError::HandshakeTimeout(handshake_timeout)).await;
            return;
        }
    };

    let entry = match accept(&state, &handshake, origin) {
        Ok(entry) => entry,
        Err(e) => {
            tracing::warn!(role = %handshake.role, "Handshake refused from {}: {}", origin, e);
            refuse(&mut ws_tx, &e).await;
            return;
        }
    };

    let (tx, rx) = mpsc::channel(state.config.relay.outbound_buffer.max(1));
    let (conn, generation, resumed) = match entry {
        Entry::Redirect { region, endpoint } => {
            tracing::info!("Redirecting {} to region {} ({})", origin, region, endpoint);
            let _ = send_message(&mut ws_tx, &ServerMessage::Redirect { region, endpoint }).await;
            let _ = ws_tx.close().await;
            return;
        }
        Entry::Resume(conn) => match state.supervisor.resume(&conn, tx).await {
            Some(generation) => (conn, generation, true),
            None => {
                refuse(&mut ws_tx, &RelayError::ReconnectFailed).await;
                return;
            }
        },
        Entry::Fresh {
            account,
            framework,
            region,
        } => match open(&state, &handshake, &account, framework, region, tx) {
            Ok((conn, generation)) => (conn, generation, false),
            Err(e) => {
                tracing::warn!("Failed to open connection for {}: {}", origin, e);
                refuse(&mut ws_tx, &e).await;
                return;
            }
        },
    };

    let token = match state.tokens.issue(&conn) {
        Ok(token) => token,
        Err(e) => {
            tracing::error!("Failed to issue session token for {}: {}", conn.id, e);
            state.supervisor.terminate(&conn, "token signing failed").await;
            refuse(&mut ws_tx, &RelayError::from(e)).await;
            return;
        }
    };
    conn.set_token(token.clone());

    let ack = ServerMessage::HandshakeAck(HandshakeAck {
        connection_id: conn.id.clone(),
        session_id: conn.session_id.clone(),
        session_token: token,
        region: conn.region.clone(),
        resumed,
        heartbeat_interval_secs: state.config.relay.heartbeat_interval_secs,
        grace_window_secs: state.supervisor.grace().as_secs(),
    });
    if let Err(e) = send_message(&mut ws_tx, &ack).await {
        tracing::error!("Failed to send HandshakeAck to {}: {}", conn.id, e);
        state.supervisor.park(&conn, generation, "handshake ack failed").await;
        return;
    }

    tracing::info!(
        connection = %conn.id,
        role = %conn.role,
        account = %conn.account_id,
        region = %conn.region,
        resumed,
        "Connection established from {}",
        origin
    );

    let writer = tokio::spawn(write_loop(ws_tx, rx, conn.id.clone()));

    if !resumed {
        match conn.role {
            Role::Trainer => state
                .supervisor
                .spawn_pairing(conn.clone(), state.config.relay.pairing_wait()),
            Role::Simulator => state.supervisor.capacity_added(&conn.account_id).await,
        }
        state.meter.notify_low_balance(&state.registry, &conn.account_id);
    }

    // Main message loop
    let heartbeat_timeout = state.config.relay.heartbeat_timeout();
    let cause = loop {
        let next = match timeout(heartbeat_timeout, ws_rx.next()).await {
            Ok(next) => next,
            Err(_) => break Some("heartbeat timeout".to_string()),
        };
        if conn.generation() != generation || !conn.is_active() {
            // superseded by a resume, or terminated elsewhere
            break None;
        }
        match next {
            Some(Ok(Message::Text(text))) => {
                if handle_control(&state, &conn, &text).await.is_break() {
                    break None;
                }
            }
            Some(Ok(Message::Binary(frame))) => {
                state.relay.forward(&conn, frame).await;
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => conn.touch(None),
            Some(Ok(Message::Close(_))) | None => break Some("socket closed".to_string()),
            Some(Err(e)) => break Some(format!("socket error: {}", e)),
        }
    };

    if let Some(cause) = cause {
        state.supervisor.park(&conn, generation, &cause).await;
    }
    writer.abort();
}

/// Decide how to treat a parsed handshake. No state is created here.
fn accept(state: &AppState, handshake: &Handshake, origin: IpAddr) -> Result<Entry, RelayError> {
    let account = authenticate(&state.ledger, &handshake.api_key)?;

    if let Some(token) = &handshake.session_token {
        match resumable(&state.registry, &state.tokens, &account, handshake.role, token) {
            Some(conn) => return Ok(Entry::Resume(conn)),
            None => tracing::info!(
                account = %account.id,
                role = %handshake.role,
                "Session token not resumable, starting a new session"
            ),
        }
    }

    let framework = validate_request(handshake)?;

    state.meter.open_wallet(&account);
    if matches!(state.meter.admit(&account.id), Admission::Blocked) {
        return Err(RelayError::CreditExhausted);
    }

    let region = match state.regions.route(
        Some(origin),
        account.home_region.as_deref(),
        handshake.region_hint.as_deref(),
        handshake.redirected,
    ) {
        RegionDecision::Redirect { region, endpoint } => {
            return Ok(Entry::Redirect { region, endpoint })
        }
        RegionDecision::Local(region) => region,
    };

    check_quotas(
        handshake,
        &account.quotas,
        state.registry.simulator_count(&account.id),
    )?;

    Ok(Entry::Fresh {
        account,
        framework,
        region,
    })
}

/// Register a new connection and, for a trainer, its session.
fn open(
    state: &AppState,
    handshake: &Handshake,
    account: &Account,
    framework: Option<Framework>,
    region: String,
    tx: mpsc::Sender<Outbound>,
) -> Result<(Arc<Connection>, u64), RelayError> {
    let (session_id, capacity) = match handshake.role {
        Role::Trainer => (Some(Uuid::new_v4().to_string()), 0),
        Role::Simulator => (None, handshake.max_env_runners),
    };
    let conn = state.registry.register(ConnectionSpec {
        role: handshake.role,
        account_id: account.id.clone(),
        region,
        session_id,
        capacity,
        framework,
    });

    if handshake.role == Role::Trainer {
        let request = PairingRequest {
            num_workers: handshake.num_workers,
            num_env_runners: handshake.num_env_runners,
        };
        if let Err(e) = state.registry.open_session(&conn, request) {
            state.registry.remove_connection(&conn.id);
            return Err(e);
        }
    }

    let generation = conn
        .bind(tx)
        .ok_or_else(|| RelayError::Internal("new connection already terminated".to_string()))?;

    match state.ledger.record_presence(&account.id) {
        Ok(true) => tracing::info!(account = %account.id, "First connection for account"),
        Ok(false) => {}
        Err(e) => tracing::warn!(account = %account.id, "Failed to record presence: {}", e),
    }

    Ok((conn, generation))
}

/// Handle a control frame after the handshake. Breaks when the connection
/// ended cleanly.
async fn handle_control(
    state: &AppState,
    conn: &Arc<Connection>,
    text: &str,
) -> std::ops::ControlFlow<()> {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(connection = %conn.id, "Unparseable control frame: {}", e);
            conn.send(ServerMessage::Error(RelayError::Protocol(e.to_string()).to_frame()));
            return std::ops::ControlFlow::Continue(());
        }
    };

    match msg {
        ClientMessage::Heartbeat(heartbeat) => {
            conn.touch(heartbeat.stats);
            conn.send(ServerMessage::Pong {
                timestamp: heartbeat.timestamp,
            });
        }
        ClientMessage::RunError(report) => {
            tracing::info!(
                connection = %conn.id,
                kind = ?report.kind,
                "Run error reported: {}",
                report.headline
            );
            state.relay.pass_through(conn, &report).await;
        }
        ClientMessage::Shutdown { reason } => {
            let reason = reason.unwrap_or_else(|| format!("{} shut down", conn.role));
            state.supervisor.terminate(conn, &reason).await;
            return std::ops::ControlFlow::Break(());
        }
        ClientMessage::Handshake(_) => {
            tracing::warn!(connection = %conn.id, "Unexpected Handshake after handshake completed");
            let err = RelayError::Protocol("Handshake already completed".to_string());
            conn.send(ServerMessage::Error(err.to_frame()));
        }
    }
    std::ops::ControlFlow::Continue(())
}

/// Drain the connection's outbound queue onto the socket.
async fn write_loop(mut ws_tx: WsSink, mut rx: mpsc::Receiver<Outbound>, connection_id: String) {
    while let Some(item) = rx.recv().await {
        let result = match item {
            Outbound::Message(msg) => send_message(&mut ws_tx, &msg).await,
            Outbound::Data(frame) => ws_tx.send(Message::Binary(frame)).await.map_err(Into::into),
            Outbound::Close(frame) => {
                if let Some(frame) = frame {
                    let _ = send_message(&mut ws_tx, &ServerMessage::Error(frame)).await;
                }
                break;
            }
        };
        if let Err(e) = result {
            tracing::debug!(connection = %connection_id, "Socket write failed: {}", e);
            break;
        }
    }
    let _ = ws_tx.close().await;
}

/// Send a ServerMessage over WebSocket.
async fn send_message<S>(
    sink: &mut S,
    msg: &ServerMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(msg)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}

/// Send a handshake-time error frame and close.
async fn refuse<S>(sink: &mut S, err: &RelayError)
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let _ = send_message(sink, &ServerMessage::Error(err.to_frame())).await;
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionState;
    use crate::test_util::{create_test_account, create_test_state};
    use axum::http::HeaderValue;
    use std::time::Duration;

    #[test]
    fn test_forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.2.0.9, 172.16.0.1"));
        assert_eq!(forwarded_for(&headers), Some("10.2.0.9".parse().unwrap()));

        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        assert_eq!(forwarded_for(&headers), None);
        assert_eq!(forwarded_for(&HeaderMap::new()), None);
    }

    #[test]
    fn test_forwarded_https() {
        let mut headers = HeaderMap::new();
        assert!(!forwarded_https(&headers));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        assert!(!forwarded_https(&headers));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("HTTPS"));
        assert!(forwarded_https(&headers));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_token_resumes_only_within_grace() {
        let dir = tempfile::tempdir().unwrap();
        let state = create_test_state(dir.path().join("ws.db").to_str().unwrap());
        let (_, api_key) = create_test_account(&state, 10);
        let origin: IpAddr = "127.0.0.1".parse().unwrap();

        let handshake = Handshake::trainer(&api_key, 1, 2);
        let Ok(Entry::Fresh {
            account,
            framework,
            region,
        }) = accept(&state, &handshake, origin)
        else {
            panic!("expected a fresh connection");
        };
        let (tx, _rx) = mpsc::channel(8);
        let (conn, generation) = open(&state, &handshake, &account, framework, region, tx).unwrap();
        let token = state.tokens.issue(&conn).unwrap();
        conn.set_token(token.clone());

        let mut resume = handshake.clone();
        resume.session_token = Some(token);
        resume.redirected = true;

        state.supervisor.park(&conn, generation, "socket closed").await;
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(matches!(
            accept(&state, &resume, origin),
            Ok(Entry::Resume(found)) if found.id == conn.id
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(conn.state(), ConnectionState::Terminated);
        let session_id = conn.session_id.clone().unwrap();
        assert!(state.registry.session(&session_id).is_none());
        assert!(matches!(accept(&state, &resume, origin), Ok(Entry::Fresh { .. })));
    }
}
