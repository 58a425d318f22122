//! Gateway (WebSocket) connection to Discord.
//!
//! This module owns the connection lifecycle as an explicit state machine:
//!
//! ```text
//! DISCONNECTED → CONNECTING → AWAITING_HELLO → HEARTBEATING_INITIAL
//!     → (IDENTIFYING | RESUMING) → READY ⟲ live loop
//!           ↑                                   │
//!     BACKOFF_SLEEP ← DISCONNECTED ←────────────┘ (any error)
//! ```
//!
//! One task owns the socket. The live loop races "next frame" against
//! "next heartbeat deadline" so heartbeats are never starved, and every
//! dispatched event runs its hook on a separate task.

use std::time::Duration;

use futures::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::events::{GatewayEvent, Hooks, Intents};
use crate::types::{GatewayCommand, GatewayPayload, ReadyEvent};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// Discord allows this many session starts per rolling window.
const SESSION_START_LIMIT: u32 = 1000;
const SESSION_START_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(30);

/// Sleep between connection attempts that keeps us under the session-start
/// limit even if every attempt identifies from scratch.
pub fn default_reconnect_delay() -> Duration {
    SESSION_START_WINDOW / SESSION_START_LIMIT
}

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Options for connecting to the Discord gateway.
#[derive(Clone)]
pub struct GatewayConfig {
    pub token: String,
    /// Endpoint used when there is no session to resume.
    pub url: String,
    /// BACKOFF_SLEEP duration before each reconnection attempt.
    pub reconnect_delay: Duration,
    pub hello_timeout: Duration,
}

impl GatewayConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            url: DEFAULT_GATEWAY_URL.to_string(),
            reconnect_delay: default_reconnect_delay(),
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("token", &"<redacted>")
            .field("url", &self.url)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("hello_timeout", &self.hello_timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    BackoffSleep,
    Connecting,
    AwaitingHello,
    HeartbeatingInitial,
    Identifying,
    Resuming,
    Ready,
}

/// Session state owned exclusively by the gateway.
///
/// `sequence` is meaningless without a `session_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub session_id: Option<String>,
    /// Highest sequence number observed in this session.
    pub sequence: Option<u64>,
    /// Endpoint to use when resuming.
    pub resume_url: Option<String>,
    pub heartbeat_interval: Duration,
    pub last_ack_received: bool,
}

impl Session {
    pub fn is_resumable(&self) -> bool {
        self.session_id.is_some() && self.resume_url.is_some()
    }

    /// Track the maximum sequence seen; out-of-order frames never move it back.
    pub fn observe_sequence(&mut self, seq: u64) {
        self.sequence = Some(self.sequence.map_or(seq, |current| current.max(seq)));
    }

    /// Capture a READY session. An already-live session wins over the new
    /// one; returns whether the READY session was adopted.
    pub fn establish(&mut self, ready: &ReadyEvent) -> bool {
        if self.session_id.is_some() {
            return false;
        }
        self.session_id = Some(ready.session_id.clone());
        self.resume_url = Some(ready.resume_gateway_url.clone());
        true
    }

    pub fn clear(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.resume_url = None;
    }
}

/// Why a live connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// Socket error or stream end.
    Transport(String),
    /// No heartbeat ACK arrived between two heartbeats.
    Zombie,
    /// Server sent op 7.
    ReconnectRequested,
    /// Server sent op 9.
    InvalidSession { resumable: bool },
    /// Close code after which the session cannot be resumed.
    SessionExpired(u16),
    /// Close code no retry can fix.
    Fatal(u16),
}

/// Failure while establishing a connection. Always retried by [`Gateway::run`].
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A socket that has completed the handshake.
pub struct Connection {
    ws: WsConnection,
    next_heartbeat: Instant,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub struct Gateway {
    config: GatewayConfig,
    hooks: Hooks,
    intents: Intents,
    session: Session,
    /// Session id taken out of `session` while a RESUME is in flight.
    resuming: Option<String>,
    state: ConnectionState,
}

impl Gateway {
    /// Hooks must be complete here: they decide the intents sent at IDENTIFY.
    pub fn new(config: GatewayConfig, hooks: Hooks) -> Self {
        let intents = hooks.intents();
        Self {
            config,
            hooks,
            intents,
            session: Session::default(),
            resuming: None,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn intents(&self) -> Intents {
        self.intents
    }

    /// Supervise the connection forever.
    ///
    /// Only a fatal close code (bad token, bad intents, ...) ends the loop.
    pub async fn run(&mut self) -> Result<()> {
        let mut first_attempt = true;
        loop {
            if !first_attempt {
                self.state = ConnectionState::BackoffSleep;
                info!(
                    delay_ms = self.config.reconnect_delay.as_millis() as u64,
                    resumable = self.session.is_resumable(),
                    "waiting before reconnecting to gateway"
                );
                sleep(self.config.reconnect_delay).await;
            }
            first_attempt = false;

            let conn = match self.connect().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "gateway connection attempt failed");
                    self.apply_disconnect(&Disconnect::Transport(e.to_string()));
                    continue;
                }
            };

            let reason = self.live_loop(conn).await;
            if let Disconnect::Fatal(code) = reason {
                error!(close_code = code, "fatal gateway close code, giving up");
                self.state = ConnectionState::Disconnected;
                return Err(Error::Gateway(format!(
                    "gateway closed with fatal code {}",
                    code
                )));
            }
            info!(reason = ?reason, "gateway disconnected");
            self.apply_disconnect(&reason);
        }
    }

    /// Open the socket and complete HELLO, the first heartbeat and
    /// IDENTIFY/RESUME. The returned connection is ready for the live loop.
    pub async fn connect(&mut self) -> std::result::Result<Connection, ConnectError> {
        self.state = ConnectionState::Connecting;
        let url = with_gateway_query(&self.prepare_attempt());
        info!(url = %url, resuming = self.resuming.is_some(), "connecting to Discord gateway");

        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;

        // HELLO
        self.state = ConnectionState::AwaitingHello;
        let interval = read_hello(&mut ws, self.config.hello_timeout).await?;
        self.session.heartbeat_interval = interval;
        info!(interval_ms = interval.as_millis() as u64, "received HELLO");

        // First heartbeat after `interval * U(0,1)` so a mass reconnect does
        // not hit the gateway all at once.
        self.state = ConnectionState::HeartbeatingInitial;
        let jitter = rand::random::<f64>();
        sleep(interval.mul_f64(jitter)).await;
        send_frame(&mut ws, &GatewayCommand::heartbeat(self.session.sequence)).await?;
        let sent_at = Instant::now();
        self.session.last_ack_received = false;
        await_ack(&mut ws, interval).await?;
        self.session.last_ack_received = true;
        debug!("initial heartbeat acknowledged");

        // IDENTIFY or RESUME
        match self.resuming.as_deref() {
            Some(session_id) => {
                self.state = ConnectionState::Resuming;
                let resume =
                    GatewayCommand::resume(&self.config.token, session_id, self.session.sequence);
                send_frame(&mut ws, &resume).await?;
                info!(session_id, seq = ?self.session.sequence, "sent RESUME");
            }
            None => {
                self.state = ConnectionState::Identifying;
                let identify = GatewayCommand::identify(&self.config.token, self.intents.bits());
                send_frame(&mut ws, &identify).await?;
                info!(intents = ?self.intents, "sent IDENTIFY");
            }
        }

        Ok(Connection {
            ws,
            next_heartbeat: sent_at + interval,
        })
    }

    /// Decide how the next attempt connects and return the endpoint.
    ///
    /// The session id is taken out *before* resuming, so a resume that fails
    /// falls back to a fresh IDENTIFY instead of retrying forever.
    fn prepare_attempt(&mut self) -> String {
        if self.session.is_resumable() {
            self.resuming = self.session.session_id.take();
            self.session
                .resume_url
                .clone()
                .unwrap_or_else(|| self.config.url.clone())
        } else {
            self.resuming = None;
            self.session.clear();
            self.config.url.clone()
        }
    }

    /// Update the session after a connection ended.
    fn apply_disconnect(&mut self, reason: &Disconnect) {
        self.state = ConnectionState::Disconnected;
        self.session.last_ack_received = false;
        let in_flight = self.resuming.take();

        match reason {
            Disconnect::Transport(_) | Disconnect::Zombie => {
                // A dropped resume stays dropped; an established session
                // (already restored on RESUMED/READY) stays resumable.
                if in_flight.is_some() {
                    self.session.clear();
                }
            }
            Disconnect::ReconnectRequested | Disconnect::InvalidSession { resumable: true } => {
                if let Some(id) = in_flight {
                    self.session.session_id = Some(id);
                }
            }
            Disconnect::InvalidSession { resumable: false }
            | Disconnect::SessionExpired(_)
            | Disconnect::Fatal(_) => self.session.clear(),
        }
    }

    /// Read frames and heartbeat until the connection ends.
    async fn live_loop(&mut self, conn: Connection) -> Disconnect {
        let Connection {
            ws,
            mut next_heartbeat,
        } = conn;
        let interval = self.session.heartbeat_interval;
        let (mut write, mut read) = ws.split();

        let reason = loop {
            tokio::select! {
                frame = read.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => break Disconnect::Transport(e.to_string()),
                        None => break Disconnect::Transport("stream ended".to_string()),
                    };

                    match frame {
                        WsMessage::Text(text) => {
                            let payload: GatewayPayload = match serde_json::from_str(&text) {
                                Ok(p) => p,
                                Err(e) => {
                                    warn!(error = %e, "failed to parse gateway payload");
                                    continue;
                                }
                            };
                            if let Some(reason) = self.handle_payload(payload, &mut write).await {
                                break reason;
                            }
                        }
                        WsMessage::Close(frame) => {
                            let code = frame.as_ref().map(|f| u16::from(f.code));
                            warn!(close_code = ?code, "WebSocket closed by server");
                            break classify_close(code);
                        }
                        // Ping/Pong/Binary: tungstenite answers pings itself.
                        _ => {}
                    }
                }

                _ = sleep_until(next_heartbeat) => {
                    if !self.session.last_ack_received {
                        warn!("no heartbeat ACK since the previous heartbeat, connection is zombied");
                        break Disconnect::Zombie;
                    }
                    self.session.last_ack_received = false;
                    let heartbeat = GatewayCommand::heartbeat(self.session.sequence);
                    if let Err(e) = send_frame(&mut write, &heartbeat).await {
                        break Disconnect::Transport(e.to_string());
                    }
                    debug!(seq = ?self.session.sequence, "sent heartbeat");
                    next_heartbeat += interval;
                }
            }
        };

        // Try to close the socket gracefully; the server may already be gone.
        let _ = write.send(WsMessage::Close(None)).await;
        reason
    }

    /// Handle one inbound frame. Returns a reason when the connection must end.
    async fn handle_payload<S>(&mut self, payload: GatewayPayload, write: &mut S) -> Option<Disconnect>
    where
        S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
    {
        if let Some(seq) = payload.s {
            self.session.observe_sequence(seq);
        }

        match GatewayEvent::from_payload(payload) {
            GatewayEvent::Ready(ready) => {
                let adopted = self.session.establish(&ready);
                self.resuming = None;
                self.state = ConnectionState::Ready;
                info!(
                    session_id = %ready.session_id,
                    user = %ready.user.tag(),
                    adopted,
                    "gateway READY"
                );
            }

            GatewayEvent::Resumed => {
                if let Some(id) = self.resuming.take() {
                    self.session.session_id = Some(id);
                }
                self.state = ConnectionState::Ready;
                info!(seq = ?self.session.sequence, "gateway RESUMED");
            }

            GatewayEvent::Dispatch(event) => {
                let kind = event.kind();
                if self.hooks.dispatch(event).is_none() {
                    trace!(event = ?kind, "no hook registered");
                }
            }

            GatewayEvent::HeartbeatAck => {
                self.session.last_ack_received = true;
                debug!("heartbeat acknowledged");
            }

            GatewayEvent::HeartbeatRequest => {
                let heartbeat = GatewayCommand::heartbeat(self.session.sequence);
                if let Err(e) = send_frame(write, &heartbeat).await {
                    return Some(Disconnect::Transport(e.to_string()));
                }
                debug!("sent requested heartbeat");
            }

            GatewayEvent::Reconnect => {
                info!("gateway requested reconnect (op 7)");
                return Some(Disconnect::ReconnectRequested);
            }

            GatewayEvent::InvalidSession(resumable) => {
                warn!(resumable, "session invalidated (op 9)");
                return Some(Disconnect::InvalidSession { resumable });
            }

            GatewayEvent::Hello(_) => debug!("ignoring HELLO on a live connection"),

            GatewayEvent::Unknown { event_name, op } => {
                trace!(event = ?event_name, op, "unhandled gateway event");
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a server close code to a disconnect reason.
fn classify_close(code: Option<u16>) -> Disconnect {
    match code {
        // Authentication failed, invalid shard, sharding required, invalid
        // API version, invalid intents, disallowed intents.
        Some(code @ (4004 | 4010..=4014)) => Disconnect::Fatal(code),
        // Invalid seq, session timed out.
        Some(code @ (4007 | 4009)) => Disconnect::SessionExpired(code),
        Some(code) => Disconnect::Transport(format!("closed with code {}", code)),
        None => Disconnect::Transport("closed without code".to_string()),
    }
}

/// Append the API version and encoding if the URL doesn't carry them.
fn with_gateway_query(url: &str) -> String {
    if url.contains("v=10") {
        url.to_string()
    } else if url.contains('?') {
        format!("{}&v=10&encoding=json", url)
    } else {
        format!("{}/?v=10&encoding=json", url.trim_end_matches('/'))
    }
}

async fn send_frame<S>(sink: &mut S, command: &GatewayCommand) -> std::result::Result<(), ConnectError>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(command)?;
    sink.send(WsMessage::Text(text.into())).await?;
    Ok(())
}

/// Next text frame as a payload, skipping pings and other control frames.
async fn next_payload(ws: &mut WsConnection) -> std::result::Result<GatewayPayload, ConnectError> {
    loop {
        let frame = ws
            .next()
            .await
            .ok_or_else(|| ConnectError::Protocol("stream ended during handshake".to_string()))??;
        match frame {
            WsMessage::Text(text) => {
                return serde_json::from_str(&text)
                    .map_err(|e| ConnectError::Protocol(format!("bad payload: {}", e)));
            }
            WsMessage::Close(frame) => {
                return Err(ConnectError::Protocol(format!(
                    "closed during handshake: {:?}",
                    frame.map(|f| u16::from(f.code))
                )));
            }
            _ => continue,
        }
    }
}

async fn read_hello(
    ws: &mut WsConnection,
    wait: Duration,
) -> std::result::Result<Duration, ConnectError> {
    let payload = timeout(wait, next_payload(ws))
        .await
        .map_err(|_| ConnectError::Timeout("HELLO"))??;
    match GatewayEvent::from_payload(payload) {
        GatewayEvent::Hello(hello) => Ok(Duration::from_millis(hello.heartbeat_interval)),
        other => Err(ConnectError::Protocol(format!(
            "expected HELLO, got {:?}",
            other
        ))),
    }
}

/// Wait up to one heartbeat interval for the ACK of the first heartbeat.
async fn await_ack(
    ws: &mut WsConnection,
    interval: Duration,
) -> std::result::Result<(), ConnectError> {
    let wait = async {
        loop {
            let payload = next_payload(ws).await?;
            match GatewayEvent::from_payload(payload) {
                GatewayEvent::HeartbeatAck => return Ok(()),
                other => debug!(event = ?other, "ignoring frame while awaiting first ACK"),
            }
        }
    };
    timeout(interval, wait)
        .await
        .map_err(|_| ConnectError::Timeout("heartbeat ACK"))?
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
