//! Signaling connection to the rendezvous server.
//!
//! The WebSocket runs in a dedicated tokio task. Callers talk to it
//! through a cloneable [`SignalingHandle`] and receive server events and
//! connection lifecycle changes on a notification channel, the same
//! command/notification split the session layer uses.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use tandem_shared::constants::{RECONNECT_BASE_MS, RECONNECT_MAX_MS};
use tandem_shared::protocol::{ClientEvent, ServerEvent};
use tandem_shared::{ConnectionStatus, UserId};

use crate::error::SignalingError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Resolves once a tracked event has been written to the socket.
pub type EmitAck = oneshot::Receiver<Result<(), SignalingError>>;

// ---------------------------------------------------------------------------
// Command / notification types
// ---------------------------------------------------------------------------

/// Commands sent *into* the signaling task.
#[derive(Debug)]
pub enum SignalingCommand {
    /// Write an event to the server.
    Emit(ClientEvent),
    /// Write an event and report whether it reached the socket.
    EmitTracked(ClientEvent, oneshot::Sender<Result<(), SignalingError>>),
    /// Close the connection and stop reconnecting.
    Shutdown,
}

/// Notifications sent *from* the signaling task to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingNotification {
    Connected,
    Disconnected,
    Reconnected,
    Error(String),
    Event(ServerEvent),
}

/// Configuration for spawning the signaling task.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:5001/ws`.
    pub url: String,
    /// Identity the connection is authenticated as.
    pub user_id: UserId,
    /// Bearer credential from the secure store.
    pub token: Option<String>,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl SignalingConfig {
    pub fn new(url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            url: url.into(),
            user_id,
            token: None,
            reconnect_base: Duration::from_millis(RECONNECT_BASE_MS),
            reconnect_max: Duration::from_millis(RECONNECT_MAX_MS),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Endpoint URL with the `user_id` query parameter attached.
    pub fn endpoint(&self) -> Result<url::Url, SignalingError> {
        let mut url = url::Url::parse(&self.url)?;
        url.query_pairs_mut()
            .append_pair("user_id", self.user_id.as_str());
        Ok(url)
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap, cloneable handle to the signaling task.
#[derive(Debug, Clone)]
pub struct SignalingHandle {
    local_user: UserId,
    cmd_tx: mpsc::Sender<SignalingCommand>,
    status: watch::Receiver<ConnectionStatus>,
}

/// The far side of a [`SignalingHandle::loopback`] handle.
pub struct LoopbackSignaling {
    /// Everything emitted through the handle.
    pub commands: mpsc::Receiver<SignalingCommand>,
    /// Drives the status the handle reports.
    pub status: watch::Sender<ConnectionStatus>,
}

impl SignalingHandle {
    /// A handle not backed by a socket. Used to embed the session layer
    /// in-process and in tests.
    pub fn loopback(local_user: UserId, capacity: usize) -> (Self, LoopbackSignaling) {
        let (cmd_tx, commands) = mpsc::channel(capacity);
        let (status_tx, status) = watch::channel(ConnectionStatus::Connected);
        (
            Self {
                local_user,
                cmd_tx,
                status,
            },
            LoopbackSignaling {
                commands,
                status: status_tx,
            },
        )
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Queue an event for the server.
    ///
    /// Room joins and leaves are accepted while disconnected and applied on
    /// reconnect. Everything else needs a live connection.
    pub async fn emit(&self, event: ClientEvent) -> Result<(), SignalingError> {
        if !self.is_connected() && !changes_membership(&event) {
            return Err(SignalingError::Unavailable);
        }
        self.cmd_tx
            .send(SignalingCommand::Emit(event))
            .await
            .map_err(|_| SignalingError::Closed)
    }

    /// Queue an event and return an [`EmitAck`] that resolves once the
    /// event is on the wire. If the connection drops first the ack carries
    /// an error, or its sender is dropped when the task shuts down.
    pub async fn emit_tracked(&self, event: ClientEvent) -> Result<EmitAck, SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Unavailable);
        }
        let (ack, rx) = oneshot::channel();
        self.cmd_tx
            .send(SignalingCommand::EmitTracked(event, ack))
            .await
            .map_err(|_| SignalingError::Closed)?;
        Ok(rx)
    }

    pub async fn join_room(&self, room: impl Into<String>) -> Result<(), SignalingError> {
        self.emit(ClientEvent::JoinRoom {
            user_id: self.local_user.clone(),
            room: room.into(),
        })
        .await
    }

    pub async fn leave_room(&self, room: impl Into<String>) -> Result<(), SignalingError> {
        self.emit(ClientEvent::LeaveRoom {
            user_id: self.local_user.clone(),
            room: room.into(),
        })
        .await
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SignalingCommand::Shutdown).await;
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Connect to the rendezvous server and spawn the signaling task.
///
/// The first connection attempt happens before this returns so callers
/// learn about a bad URL or an unreachable server immediately. Later drops
/// are retried with exponential backoff.
pub async fn spawn_signaling(
    config: SignalingConfig,
) -> Result<(SignalingHandle, mpsc::Receiver<SignalingNotification>), SignalingError> {
    let ws = connect(&config).await?;
    info!(user = %config.user_id.short(), url = %config.url, "Signaling connected");

    let (cmd_tx, cmd_rx) = mpsc::channel::<SignalingCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<SignalingNotification>(256);
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);

    let _ = notif_tx.try_send(SignalingNotification::Connected);

    let handle = SignalingHandle {
        local_user: config.user_id.clone(),
        cmd_tx,
        status: status_rx,
    };

    tokio::spawn(async move {
        run(config, ws, cmd_rx, notif_tx, status_tx).await;
    });

    Ok((handle, notif_rx))
}

async fn connect(config: &SignalingConfig) -> Result<WsStream, SignalingError> {
    let endpoint = config.endpoint()?;
    let mut request = endpoint.as_str().into_client_request()?;
    if let Some(token) = &config.token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| SignalingError::InvalidToken)?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

async fn run(
    config: SignalingConfig,
    ws: WsStream,
    mut cmd_rx: mpsc::Receiver<SignalingCommand>,
    notif_tx: mpsc::Sender<SignalingNotification>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    // Rooms currently joined, replayed after every reconnect
    let mut rooms: Vec<ClientEvent> = Vec::new();
    let mut ws = Some(ws);

    loop {
        let stream = match ws.take() {
            Some(stream) => stream,
            None => match reconnect(&config, &mut cmd_rx, &notif_tx, &status_tx, &mut rooms).await {
                Some(stream) => stream,
                None => break,
            },
        };

        match session(stream, &mut cmd_rx, &notif_tx, &mut rooms).await {
            SessionEnd::Shutdown => break,
            SessionEnd::Dropped(reason) => {
                warn!(reason = %reason, "Signaling connection lost");
                status_tx.send_replace(ConnectionStatus::Disconnected);
                let _ = notif_tx.send(SignalingNotification::Disconnected).await;
            }
        }
    }

    status_tx.send_replace(ConnectionStatus::Disconnected);
    info!("Signaling task terminated");
}

async fn session(
    ws: WsStream,
    cmd_rx: &mut mpsc::Receiver<SignalingCommand>,
    notif_tx: &mpsc::Sender<SignalingNotification>,
    rooms: &mut Vec<ClientEvent>,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();

    for join in rooms.iter() {
        if let Ok(text) = join.to_json() {
            if let Err(e) = write.send(Message::Text(text)).await {
                return SessionEnd::Dropped(e.to_string());
            }
        }
    }

    loop {
        tokio::select! {
            // --- Outgoing events ---
            cmd = cmd_rx.recv() => {
                let (event, ack) = match cmd {
                    Some(SignalingCommand::Emit(event)) => (event, None),
                    Some(SignalingCommand::EmitTracked(event, ack)) => (event, Some(ack)),
                    Some(SignalingCommand::Shutdown) | None => {
                        info!("Signaling shutdown requested");
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                };
                track_rooms(rooms, &event);
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(event = event.name(), error = %e, "Failed to encode signaling event");
                        settle(ack, Err(e.into()));
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    settle(ack, Err(SignalingError::Unavailable));
                    return SessionEnd::Dropped(e.to_string());
                }
                debug!(event = event.name(), "Signaling event sent");
                settle(ack, Ok(()));
            }

            // --- Incoming frames ---
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match ServerEvent::from_json(&text) {
                        Ok(event) => {
                            debug!(event = event.name(), "Signaling event received");
                            let _ = notif_tx.send(SignalingNotification::Event(event)).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "Ignoring malformed signaling event");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Dropped("closed by server".into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = notif_tx.send(SignalingNotification::Error(e.to_string())).await;
                        return SessionEnd::Dropped(e.to_string());
                    }
                }
            }
        }
    }
}

async fn reconnect(
    config: &SignalingConfig,
    cmd_rx: &mut mpsc::Receiver<SignalingCommand>,
    notif_tx: &mpsc::Sender<SignalingNotification>,
    status_tx: &watch::Sender<ConnectionStatus>,
    rooms: &mut Vec<ClientEvent>,
) -> Option<WsStream> {
    let mut attempt: u32 = 0;

    loop {
        let delay = backoff_delay(attempt, config.reconnect_base, config.reconnect_max);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = cmd_rx.recv() => {
                    if !handle_offline(rooms, cmd) {
                        return None;
                    }
                }
            }
        }

        status_tx.send_replace(ConnectionStatus::Connecting);
        match connect(config).await {
            Ok(ws) => {
                info!(attempt, "Signaling reconnected");
                status_tx.send_replace(ConnectionStatus::Connected);
                let _ = notif_tx.send(SignalingNotification::Reconnected).await;
                return Some(ws);
            }
            Err(e) => {
                warn!(attempt, error = %e, "Signaling reconnect failed");
                status_tx.send_replace(ConnectionStatus::Disconnected);
                let _ = notif_tx.send(SignalingNotification::Error(e.to_string())).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

fn changes_membership(event: &ClientEvent) -> bool {
    matches!(
        event,
        ClientEvent::JoinRoom { .. } | ClientEvent::LeaveRoom { .. }
    )
}

/// Keep the replay list in step with joins and leaves. Returns whether the
/// event changed room membership.
fn track_rooms(rooms: &mut Vec<ClientEvent>, event: &ClientEvent) -> bool {
    match event {
        ClientEvent::JoinRoom { .. } => {
            if !rooms.contains(event) {
                rooms.push(event.clone());
            }
            true
        }
        ClientEvent::LeaveRoom { room: left, .. } => {
            rooms.retain(|joined| !matches!(joined, ClientEvent::JoinRoom { room, .. } if room == left));
            true
        }
        _ => false,
    }
}

/// Handle a command while there is no socket. Membership changes are kept
/// for the next connection; anything else is refused. Returns false once
/// the task should stop.
fn handle_offline(rooms: &mut Vec<ClientEvent>, cmd: Option<SignalingCommand>) -> bool {
    match cmd {
        Some(SignalingCommand::Emit(event)) => {
            if !track_rooms(rooms, &event) {
                debug!(event = event.name(), "Dropping signaling event while disconnected");
            }
            true
        }
        Some(SignalingCommand::EmitTracked(event, ack)) => {
            debug!(event = event.name(), "Refusing tracked signaling event while disconnected");
            let _ = ack.send(Err(SignalingError::Unavailable));
            true
        }
        Some(SignalingCommand::Shutdown) | None => false,
    }
}

fn settle(
    ack: Option<oneshot::Sender<Result<(), SignalingError>>>,
    result: Result<(), SignalingError>,
) {
    if let Some(ack) = ack {
        let _ = ack.send(result);
    }
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}
