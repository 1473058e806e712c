//! Peer session manager.
//!
//! A single tokio task owns every [`PeerSession`]. Commands from the
//! application, signaling events, transport events and negotiation
//! timeouts all arrive as messages, so transitions for one peer never run
//! concurrently. Callers talk to it through a cloneable [`SessionHandle`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tandem_net::{SignalingError, SignalingHandle, SignalingNotification};
use tandem_shared::constants::NEGOTIATION_TIMEOUT_SECS;
use tandem_shared::protocol::{
    ChatEnvelope, ClientEvent, IceCandidate, ProfileUpdate, ServerEvent, SessionDescription,
};
use tandem_shared::{ConnectionStatus, DeliveryPath, UserId};

use crate::error::{FallbackReason, SessionError};
use crate::session::{NegotiationRole, PeerSession, SessionSnapshot, SessionState};
use crate::transport::{DirectTransport, TransportEvent, TransportEventKind};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a negotiation may take before the session falls back to relay.
    pub negotiation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(NEGOTIATION_TIMEOUT_SECS),
        }
    }
}

// ---------------------------------------------------------------------------
// Command / notification types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SessionCommand {
    /// Make sure a session exists for the peer and try to go direct.
    Join(UserId),
    Send {
        envelope: ChatEnvelope,
        reply: oneshot::Sender<Result<DeliveryPath, SessionError>>,
    },
    Disconnect(UserId),
    DisconnectAll,
    Snapshot(oneshot::Sender<Vec<SessionSnapshot>>),
    Session(UserId, oneshot::Sender<Option<SessionSnapshot>>),
    Shutdown,
}

/// Notifications sent from the manager to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotification {
    /// An envelope arrived from a peer.
    Message {
        envelope: ChatEnvelope,
        path: DeliveryPath,
    },
    ProfileUpdate(ProfileUpdate),
    StateChanged {
        peer: UserId,
        state: SessionState,
        reason: Option<FallbackReason>,
    },
    Connection(ConnectionStatus),
    SignalingError(String),
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Ensure a session with `peer` exists. Returns once queued; progress
    /// is reported through [`SessionNotification::StateChanged`].
    pub async fn join_session(&self, peer: UserId) -> Result<(), SessionError> {
        self.send_cmd(SessionCommand::Join(peer)).await
    }

    /// Deliver an envelope to its recipient, directly when possible.
    pub async fn send_message(&self, envelope: ChatEnvelope) -> Result<DeliveryPath, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(SessionCommand::Send { envelope, reply }).await?;
        rx.await.map_err(|_| SessionError::ManagerClosed)?
    }

    pub async fn disconnect(&self, peer: UserId) -> Result<(), SessionError> {
        self.send_cmd(SessionCommand::Disconnect(peer)).await
    }

    pub async fn disconnect_all(&self) -> Result<(), SessionError> {
        self.send_cmd(SessionCommand::DisconnectAll).await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionSnapshot>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(SessionCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| SessionError::ManagerClosed)
    }

    pub async fn session(&self, peer: UserId) -> Result<Option<SessionSnapshot>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(SessionCommand::Session(peer, reply)).await?;
        rx.await.map_err(|_| SessionError::ManagerClosed)
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
    }

    async fn send_cmd(&self, cmd: SessionCommand) -> Result<(), SessionError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SessionError::ManagerClosed)
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the session manager task.
///
/// `signaling_rx` is the notification stream paired with `signaling`.
pub fn spawn_session_manager(
    signaling: SignalingHandle,
    signaling_rx: mpsc::Receiver<SignalingNotification>,
    transport: Arc<dyn DirectTransport>,
    config: SessionConfig,
) -> (SessionHandle, mpsc::Receiver<SessionNotification>) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<SessionCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<SessionNotification>(256);
    let (transport_tx, transport_rx) = mpsc::channel::<TransportEvent>(256);
    let (timeout_tx, timeout_rx) = mpsc::channel::<(UserId, u64)>(64);

    let manager = SessionManager {
        local: signaling.local_user().clone(),
        signaling,
        transport,
        config,
        sessions: HashMap::new(),
        next_epoch: 0,
        transport_tx,
        timeout_tx,
        notif_tx,
    };

    tokio::spawn(manager.run(cmd_rx, signaling_rx, transport_rx, timeout_rx));

    (SessionHandle { cmd_tx }, notif_rx)
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct SessionManager {
    local: UserId,
    signaling: SignalingHandle,
    transport: Arc<dyn DirectTransport>,
    config: SessionConfig,
    sessions: HashMap<UserId, PeerSession>,
    next_epoch: u64,
    transport_tx: mpsc::Sender<TransportEvent>,
    timeout_tx: mpsc::Sender<(UserId, u64)>,
    notif_tx: mpsc::Sender<SessionNotification>,
}

impl SessionManager {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        mut signaling_rx: mpsc::Receiver<SignalingNotification>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
        mut timeout_rx: mpsc::Receiver<(UserId, u64)>,
    ) {
        info!(user = %self.local.short(), "Session manager started");
        let mut signaling_open = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Shutdown) => {
                            info!("Session manager shutdown requested");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            info!("Command channel closed, shutting down session manager");
                            break;
                        }
                    }
                }

                notif = signaling_rx.recv(), if signaling_open => {
                    match notif {
                        Some(notif) => self.handle_signaling(notif).await,
                        None => {
                            warn!("Signaling task ended");
                            signaling_open = false;
                            self.notify(SessionNotification::Connection(ConnectionStatus::Disconnected)).await;
                        }
                    }
                }

                Some(event) = transport_rx.recv() => {
                    self.handle_transport(event).await;
                }

                Some((peer, epoch)) = timeout_rx.recv() => {
                    self.handle_timeout(peer, epoch).await;
                }
            }
        }

        self.close_all().await;
        info!("Session manager stopped");
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Join(peer) => self.join(peer).await,
            SessionCommand::Send { envelope, reply } => self.send(envelope, reply).await,
            SessionCommand::Disconnect(peer) => self.disconnect(&peer).await,
            SessionCommand::DisconnectAll => self.close_all().await,
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.sessions.values().map(PeerSession::snapshot).collect());
            }
            SessionCommand::Session(peer, reply) => {
                let _ = reply.send(self.sessions.get(&peer).map(PeerSession::snapshot));
            }
            SessionCommand::Shutdown => {}
        }
    }

    async fn handle_signaling(&mut self, notif: SignalingNotification) {
        match notif {
            SignalingNotification::Connected | SignalingNotification::Reconnected => {
                self.notify(SessionNotification::Connection(ConnectionStatus::Connected))
                    .await;
            }
            SignalingNotification::Disconnected => {
                self.notify(SessionNotification::Connection(ConnectionStatus::Disconnected))
                    .await;
            }
            SignalingNotification::Error(e) => {
                self.notify(SessionNotification::SignalingError(e)).await;
            }
            SignalingNotification::Event(event) => self.handle_server_event(event).await,
        }
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::UserJoined { user_id } => self.on_user_joined(user_id).await,
            ServerEvent::Offer { sender_id, offer } => self.on_offer(sender_id, offer).await,
            ServerEvent::Answer { sender_id, answer } => self.on_answer(sender_id, answer).await,
            ServerEvent::IceCandidate {
                sender_id,
                candidate,
            } => self.on_candidate(sender_id, candidate).await,
            ServerEvent::Message(envelope) => {
                debug!(from = %envelope.sender_id.short(), id = %envelope.id, "Relayed message");
                self.notify(SessionNotification::Message {
                    envelope,
                    path: DeliveryPath::Relayed,
                })
                .await;
            }
            ServerEvent::ProfileUpdate(update) => {
                self.notify(SessionNotification::ProfileUpdate(update)).await;
            }
        }
    }

    // --- Lifecycle ---

    async fn join(&mut self, peer: UserId) {
        if peer == self.local {
            warn!("Refusing to open a session with ourselves");
            return;
        }

        if let Err(e) = self.signaling.join_room(self.local.pair_room(&peer)).await {
            warn!(peer = %peer.short(), error = %e, "Could not join pair room");
        }

        let state = self.sessions.get(&peer).map(PeerSession::state);
        match state {
            None => {
                let role = NegotiationRole::for_pair(&self.local, &peer);
                self.sessions
                    .insert(peer.clone(), PeerSession::new(peer.clone(), role));
                self.negotiate(&peer).await;
            }
            Some(SessionState::Idle) | Some(SessionState::Fallback) => {
                self.negotiate(&peer).await;
            }
            Some(state) => debug!(peer = %peer.short(), ?state, "Session already active"),
        }
    }

    async fn on_user_joined(&mut self, peer: UserId) {
        // Only rooms we joined announce peers; without a session the room
        // was already left.
        let Some(session) = self.sessions.get(&peer) else {
            debug!(peer = %peer.short(), "Join from peer without a session ignored");
            return;
        };

        let retry = match session.state() {
            SessionState::Idle | SessionState::Fallback => true,
            // Our earlier offer may have gone to an absent peer.
            SessionState::Negotiating => session.awaits_answer(),
            _ => false,
        };
        if retry {
            debug!(peer = %peer.short(), "Peer joined, negotiating");
            self.negotiate(&peer).await;
        }
    }

    /// Start a fresh attempt according to the pair's role: the offerer
    /// sends an offer, the answerer arms its timer and waits for one.
    async fn negotiate(&mut self, peer: &UserId) {
        let epoch = self.bump_epoch();
        let timeout = self.spawn_timeout(peer.clone(), epoch);
        let Some(session) = self.sessions.get_mut(peer) else {
            timeout.abort();
            return;
        };
        if let Some(old) = session.take_link() {
            old.close().await;
        }
        let role = NegotiationRole::for_pair(&self.local, peer);
        if !session.begin_negotiation(epoch, role) {
            timeout.abort();
            return;
        }
        session.set_timeout(timeout);
        self.notify_state(peer).await;

        if role == NegotiationRole::Offerer {
            if let Err(reason) = self.send_offer(peer, epoch).await {
                self.fall_back(peer, reason).await;
            }
        }
    }

    async fn send_offer(&mut self, peer: &UserId, epoch: u64) -> Result<(), FallbackReason> {
        let link = self
            .transport
            .open(peer, epoch, self.transport_tx.clone())
            .await
            .map_err(|e| FallbackReason::TransportUnavailable(e.to_string()))?;

        let offer = match link.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                link.close().await;
                return Err(FallbackReason::NegotiationFailed(e.to_string()));
            }
        };

        if let Some(session) = self.sessions.get_mut(peer) {
            session.set_link(link);
        } else {
            link.close().await;
            return Ok(());
        }

        self.signaling
            .emit(ClientEvent::Offer {
                recipient_id: peer.clone(),
                offer,
            })
            .await
            .map_err(|e| FallbackReason::TransportUnavailable(e.to_string()))?;
        debug!(peer = %peer.short(), epoch, "Offer sent");
        Ok(())
    }

    async fn on_offer(&mut self, peer: UserId, offer: SessionDescription) {
        if peer == self.local {
            return;
        }
        let role = NegotiationRole::for_pair(&self.local, &peer);
        let state = self
            .sessions
            .entry(peer.clone())
            .or_insert_with(|| PeerSession::new(peer.clone(), role))
            .state();

        if state == SessionState::Connected {
            self.fall_back(
                &peer,
                FallbackReason::TransportUnavailable("peer restarted negotiation".into()),
            )
            .await;
        }

        let epoch = self.bump_epoch();
        let timeout = self.spawn_timeout(peer.clone(), epoch);
        let Some(session) = self.sessions.get_mut(&peer) else {
            timeout.abort();
            return;
        };
        if let Some(old) = session.take_link() {
            old.close().await;
        }
        if !session.begin_negotiation(epoch, NegotiationRole::Answerer) {
            timeout.abort();
            return;
        }
        session.set_timeout(timeout);
        self.notify_state(&peer).await;

        if let Err(reason) = self.send_answer(&peer, epoch, &offer).await {
            self.fall_back(&peer, reason).await;
        }
    }

    async fn send_answer(
        &mut self,
        peer: &UserId,
        epoch: u64,
        offer: &SessionDescription,
    ) -> Result<(), FallbackReason> {
        let link = self
            .transport
            .open(peer, epoch, self.transport_tx.clone())
            .await
            .map_err(|e| FallbackReason::TransportUnavailable(e.to_string()))?;

        let answer = match link.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                link.close().await;
                return Err(FallbackReason::NegotiationFailed(e.to_string()));
            }
        };

        let Some(session) = self.sessions.get_mut(peer) else {
            link.close().await;
            return Ok(());
        };
        for candidate in session.on_remote_description() {
            if let Err(e) = link.add_candidate(&candidate).await {
                debug!(peer = %peer.short(), error = %e, "Buffered candidate rejected");
            }
        }
        session.set_link(link);

        self.signaling
            .emit(ClientEvent::Answer {
                recipient_id: peer.clone(),
                answer,
            })
            .await
            .map_err(|e| FallbackReason::TransportUnavailable(e.to_string()))?;
        debug!(peer = %peer.short(), epoch, "Answer sent");
        Ok(())
    }

    async fn on_answer(&mut self, peer: UserId, answer: SessionDescription) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            debug!(peer = %peer.short(), "Answer for unknown session discarded");
            return;
        };
        if !session.awaits_answer() {
            debug!(peer = %peer.short(), state = ?session.state(), "Stale answer discarded");
            return;
        }

        let pending = session.on_remote_description();
        let result = match session.link() {
            Some(link) => {
                let applied = link.apply_answer(&answer).await;
                if applied.is_ok() {
                    for candidate in &pending {
                        if let Err(e) = link.add_candidate(candidate).await {
                            debug!(peer = %peer.short(), error = %e, "Buffered candidate rejected");
                        }
                    }
                }
                applied
            }
            None => return,
        };

        if let Err(e) = result {
            warn!(peer = %peer.short(), error = %e, "Failed to apply answer");
            self.fall_back(&peer, FallbackReason::NegotiationFailed(e.to_string()))
                .await;
        }
    }

    async fn on_candidate(&mut self, peer: UserId, candidate: IceCandidate) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            debug!(peer = %peer.short(), "Candidate for unknown session discarded");
            return;
        };
        if !session.accepts_candidates() {
            debug!(peer = %peer.short(), state = ?session.state(), "Candidate discarded");
            return;
        }
        if !session.remote_description_set() {
            session.buffer_candidate(candidate);
            return;
        }
        if let Some(link) = session.link() {
            if let Err(e) = link.add_candidate(&candidate).await {
                debug!(peer = %peer.short(), error = %e, "Candidate rejected");
            }
        }
    }

    // --- Transport ---

    async fn handle_transport(&mut self, event: TransportEvent) {
        let TransportEvent { peer, epoch, kind } = event;
        let current = self.sessions.get(&peer).map(PeerSession::epoch);
        if current != Some(epoch) {
            debug!(peer = %peer.short(), epoch, "Stale transport event dropped");
            return;
        }

        match kind {
            TransportEventKind::LocalCandidate(candidate) => {
                let event = ClientEvent::IceCandidate {
                    recipient_id: peer.clone(),
                    candidate,
                };
                if let Err(e) = self.signaling.emit(event).await {
                    debug!(peer = %peer.short(), error = %e, "Could not trickle candidate");
                }
            }
            TransportEventKind::ChannelOpen => {
                let connected = self
                    .sessions
                    .get_mut(&peer)
                    .map(PeerSession::mark_connected)
                    .unwrap_or(false);
                if connected {
                    info!(peer = %peer.short(), "Direct channel open");
                    self.notify_state(&peer).await;
                }
            }
            TransportEventKind::ChannelClosed => {
                self.fall_back(
                    &peer,
                    FallbackReason::TransportUnavailable("channel closed".into()),
                )
                .await;
            }
            TransportEventKind::ChannelError(e) => {
                warn!(peer = %peer.short(), error = %e, "Direct channel error");
                self.fall_back(&peer, FallbackReason::TransportUnavailable(e))
                    .await;
            }
            TransportEventKind::Data(bytes) => match ChatEnvelope::from_bytes(&bytes) {
                Ok(envelope) if envelope.sender_id == peer => {
                    self.notify(SessionNotification::Message {
                        envelope,
                        path: DeliveryPath::Direct,
                    })
                    .await;
                }
                Ok(envelope) => {
                    warn!(
                        peer = %peer.short(),
                        claimed = %envelope.sender_id.short(),
                        "Envelope sender does not match channel"
                    );
                }
                Err(e) => warn!(peer = %peer.short(), error = %e, "Invalid payload on channel"),
            },
        }
    }

    async fn handle_timeout(&mut self, peer: UserId, epoch: u64) {
        let expired = self
            .sessions
            .get(&peer)
            .map(|s| s.epoch() == epoch && s.state() == SessionState::Negotiating)
            .unwrap_or(false);
        if expired {
            info!(peer = %peer.short(), epoch, "Negotiation timed out");
            self.fall_back(&peer, FallbackReason::NegotiationTimeout).await;
        }
    }

    // --- Delivery ---

    /// Deliver over the direct channel when it is up, otherwise through the
    /// relay. A relayed send is answered once the signaling task has written
    /// it, without holding up the actor.
    async fn send(
        &mut self,
        envelope: ChatEnvelope,
        reply: oneshot::Sender<Result<DeliveryPath, SessionError>>,
    ) {
        let peer = envelope.recipient_id.clone();
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        let direct = match self.sessions.get(&peer) {
            Some(session) if session.state() == SessionState::Connected => {
                match session.link() {
                    Some(link) if link.is_writable() => Some(link.send(&bytes).await),
                    _ => None,
                }
            }
            _ => None,
        };

        match direct {
            Some(Ok(())) => {
                let _ = reply.send(Ok(DeliveryPath::Direct));
                return;
            }
            Some(Err(e)) => {
                warn!(peer = %peer.short(), error = %e, "Direct send failed, relaying");
                self.fall_back(&peer, FallbackReason::TransportUnavailable(e.to_string()))
                    .await;
            }
            None => {}
        }

        let event = ClientEvent::Message {
            recipient_id: peer.clone(),
            message: envelope,
        };
        let ack = match self.signaling.emit_tracked(event).await {
            Ok(ack) => ack,
            Err(e) => {
                let _ = reply.send(Err(SessionError::delivery_failure(&peer, e)));
                return;
            }
        };

        tokio::spawn(async move {
            let result = match ack.await {
                Ok(Ok(())) => Ok(DeliveryPath::Relayed),
                Ok(Err(e)) => Err(SessionError::delivery_failure(&peer, e)),
                Err(_) => Err(SessionError::delivery_failure(&peer, SignalingError::Closed)),
            };
            if let Err(e) = &result {
                warn!(peer = %peer.short(), error = %e, "Relay did not take the message");
            }
            let _ = reply.send(result);
        });
    }

    // --- Helpers ---

    async fn fall_back(&mut self, peer: &UserId, reason: FallbackReason) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        let Some(link) = session.fall_back(reason.clone()) else {
            return;
        };
        if let Some(link) = link {
            link.close().await;
        }
        info!(peer = %peer.short(), reason = %reason, "Session using relay");
        self.notify_state(peer).await;
    }

    async fn disconnect(&mut self, peer: &UserId) {
        let Some(mut session) = self.sessions.remove(peer) else {
            return;
        };
        if let Some(link) = session.close() {
            link.close().await;
        }
        if let Err(e) = self.signaling.leave_room(self.local.pair_room(peer)).await {
            debug!(peer = %peer.short(), error = %e, "Could not leave pair room");
        }
        debug!(peer = %peer.short(), "Session closed");
        self.notify(SessionNotification::StateChanged {
            peer: peer.clone(),
            state: SessionState::Closed,
            reason: None,
        })
        .await;
    }

    async fn close_all(&mut self) {
        let peers: Vec<UserId> = self.sessions.keys().cloned().collect();
        for peer in peers {
            self.disconnect(&peer).await;
        }
    }

    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    fn spawn_timeout(&self, peer: UserId, epoch: u64) -> JoinHandle<()> {
        let tx = self.timeout_tx.clone();
        let after = self.config.negotiation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send((peer, epoch)).await;
        })
    }

    async fn notify_state(&self, peer: &UserId) {
        if let Some(snapshot) = self.sessions.get(peer).map(PeerSession::snapshot) {
            self.notify(SessionNotification::StateChanged {
                peer: snapshot.peer,
                state: snapshot.state,
                reason: snapshot.fallback_reason,
            })
            .await;
        }
    }

    async fn notify(&self, notif: SessionNotification) {
        if self.notif_tx.send(notif).await.is_err() {
            error!("Session notification receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use tandem_net::{LoopbackSignaling, SignalingCommand};
    use tokio::sync::watch;
    use tandem_shared::MessageId;

    use crate::error::TransportError;
    use crate::transport::{DirectLink, RelayOnly};

    // --- Mock transport ---

    struct LinkState {
        peer: UserId,
        epoch: u64,
        events: mpsc::Sender<TransportEvent>,
        writable: AtomicBool,
        fail_send: AtomicBool,
        closed: AtomicBool,
        sent: Mutex<Vec<Vec<u8>>>,
        candidates: Mutex<Vec<IceCandidate>>,
        answer: Mutex<Option<SessionDescription>>,
    }

    impl LinkState {
        async fn emit(&self, kind: TransportEventKind) {
            self.events
                .send(TransportEvent::new(self.peer.clone(), self.epoch, kind))
                .await
                .unwrap();
        }
    }

    struct MockLink(Arc<LinkState>);

    #[async_trait]
    impl DirectLink for MockLink {
        async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
            Ok(SessionDescription::offer(format!("offer-{}", self.0.epoch)))
        }

        async fn accept_offer(
            &self,
            _offer: &SessionDescription,
        ) -> Result<SessionDescription, TransportError> {
            Ok(SessionDescription::answer(format!("answer-{}", self.0.epoch)))
        }

        async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), TransportError> {
            *self.0.answer.lock().unwrap() = Some(answer.clone());
            Ok(())
        }

        async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
            self.0.candidates.lock().unwrap().push(candidate.clone());
            Ok(())
        }

        async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
            if self.0.fail_send.load(Ordering::SeqCst) {
                return Err(TransportError::NotOpen);
            }
            self.0.sent.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        fn is_writable(&self) -> bool {
            self.0.writable.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.0.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default, Clone)]
    struct MockTransport {
        links: Arc<Mutex<Vec<Arc<LinkState>>>>,
    }

    impl MockTransport {
        fn latest(&self) -> Arc<LinkState> {
            self.links.lock().unwrap().last().cloned().unwrap()
        }

        fn opened(&self) -> usize {
            self.links.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DirectTransport for MockTransport {
        async fn open(
            &self,
            peer: &UserId,
            epoch: u64,
            events: mpsc::Sender<TransportEvent>,
        ) -> Result<Box<dyn DirectLink>, TransportError> {
            let state = Arc::new(LinkState {
                peer: peer.clone(),
                epoch,
                events,
                writable: AtomicBool::new(true),
                fail_send: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
                candidates: Mutex::new(Vec::new()),
                answer: Mutex::new(None),
            });
            self.links.lock().unwrap().push(state.clone());
            Ok(Box::new(MockLink(state)))
        }
    }

    // --- Harness ---

    struct Harness {
        handle: SessionHandle,
        notifs: mpsc::Receiver<SessionNotification>,
        emits: mpsc::Receiver<ClientEvent>,
        status: watch::Sender<ConnectionStatus>,
        /// Answer tracked emits as if the socket dropped.
        fail_relay: Arc<AtomicBool>,
        signaling_tx: mpsc::Sender<SignalingNotification>,
        transport: MockTransport,
    }

    /// Play the signaling task: confirm tracked writes and hand every
    /// emitted event to the test.
    fn spawn_far_side(
        mut commands: mpsc::Receiver<SignalingCommand>,
        fail_relay: Arc<AtomicBool>,
    ) -> mpsc::Receiver<ClientEvent> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(cmd) = commands.recv().await {
                let event = match cmd {
                    SignalingCommand::Emit(event) => event,
                    SignalingCommand::EmitTracked(event, ack) => {
                        let result = if fail_relay.load(Ordering::SeqCst) {
                            Err(SignalingError::Unavailable)
                        } else {
                            Ok(())
                        };
                        let _ = ack.send(result);
                        event
                    }
                    SignalingCommand::Shutdown => break,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    fn harness_with(
        local: &str,
        transport: Arc<dyn DirectTransport>,
        mock: MockTransport,
        timeout: Duration,
    ) -> Harness {
        let (signaling, loopback) = SignalingHandle::loopback(UserId::from(local), 64);
        let LoopbackSignaling { commands, status } = loopback;
        let fail_relay = Arc::new(AtomicBool::new(false));
        let emits = spawn_far_side(commands, fail_relay.clone());
        let (signaling_tx, signaling_rx) = mpsc::channel(64);
        let (handle, notifs) = spawn_session_manager(
            signaling,
            signaling_rx,
            transport,
            SessionConfig {
                negotiation_timeout: timeout,
            },
        );
        Harness {
            handle,
            notifs,
            emits,
            status,
            fail_relay,
            signaling_tx,
            transport: mock,
        }
    }

    fn harness(local: &str) -> Harness {
        let mock = MockTransport::default();
        harness_with(local, Arc::new(mock.clone()), mock, Duration::from_secs(30))
    }

    impl Harness {
        async fn next_emit(&mut self) -> ClientEvent {
            tokio::time::timeout(Duration::from_secs(2), self.emits.recv())
                .await
                .expect("no signaling command")
                .expect("signaling channel closed")
        }

        async fn server(&self, event: ServerEvent) {
            self.signaling_tx
                .send(SignalingNotification::Event(event))
                .await
                .unwrap();
        }

        async fn wait_for(&self, peer: &str, state: SessionState) -> SessionSnapshot {
            for _ in 0..200 {
                if let Some(s) = self.handle.session(UserId::from(peer)).await.unwrap() {
                    if s.state == state {
                        return s;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("session with {peer} never reached {state:?}");
        }

        /// alice joins bob, bob answers, channel opens.
        async fn connect_direct(&mut self) -> Arc<LinkState> {
            self.handle.join_session(UserId::from("bob")).await.unwrap();
            assert!(matches!(self.next_emit().await, ClientEvent::JoinRoom { .. }));
            assert!(matches!(self.next_emit().await, ClientEvent::Offer { .. }));
            self.server(ServerEvent::Answer {
                sender_id: UserId::from("bob"),
                answer: SessionDescription::answer("remote"),
            })
            .await;
            let link = self.transport.latest();
            for _ in 0..200 {
                if link.answer.lock().unwrap().is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            link.emit(TransportEventKind::ChannelOpen).await;
            self.wait_for("bob", SessionState::Connected).await;
            link
        }
    }

    fn envelope(from: &str, to: &str) -> ChatEnvelope {
        ChatEnvelope {
            id: MessageId::new(),
            sender_id: UserId::from(from),
            recipient_id: UserId::from(to),
            message: "ciphertext".into(),
            timestamp: Utc::now(),
        }
    }

    fn candidate(n: u8) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    // --- Tests ---

    #[tokio::test]
    async fn test_join_sends_room_and_offer() {
        let mut h = harness("alice");
        h.handle.join_session(UserId::from("bob")).await.unwrap();

        assert_eq!(
            h.next_emit().await,
            ClientEvent::JoinRoom {
                user_id: UserId::from("alice"),
                room: "dm:alice:bob".into(),
            }
        );
        match h.next_emit().await {
            ClientEvent::Offer { recipient_id, .. } => assert_eq!(recipient_id.as_str(), "bob"),
            other => panic!("expected offer, got {other:?}"),
        }

        let s = h.wait_for("bob", SessionState::Negotiating).await;
        assert_eq!(s.role, NegotiationRole::Offerer);
        assert!(!s.direct_channel);
    }

    #[tokio::test]
    async fn test_repeated_join_keeps_one_session() {
        let h = harness("alice");
        for _ in 0..3 {
            h.handle.join_session(UserId::from("bob")).await.unwrap();
        }
        let sessions = h.handle.sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(h.transport.opened(), 1);
    }

    #[tokio::test]
    async fn test_answerer_waits_for_offer() {
        let h = harness("bob");
        h.handle.join_session(UserId::from("alice")).await.unwrap();
        let s = h.wait_for("alice", SessionState::Negotiating).await;
        assert_eq!(s.role, NegotiationRole::Answerer);
        assert_eq!(h.transport.opened(), 0);
    }

    #[tokio::test]
    async fn test_self_join_is_ignored() {
        let h = harness("alice");
        h.handle.join_session(UserId::from("alice")).await.unwrap();
        assert!(h.handle.sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connected_session_sends_direct() {
        let mut h = harness("alice");
        let link = h.connect_direct().await;

        let s = h.handle.session(UserId::from("bob")).await.unwrap().unwrap();
        assert!(s.direct_channel);

        let env = envelope("alice", "bob");
        let path = h.handle.send_message(env.clone()).await.unwrap();
        assert_eq!(path, DeliveryPath::Direct);

        let sent = link.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(ChatEnvelope::from_bytes(&sent[0]).unwrap(), env);
    }

    #[tokio::test]
    async fn test_unwritable_channel_uses_relay() {
        let mut h = harness("alice");
        let link = h.connect_direct().await;
        link.writable.store(false, Ordering::SeqCst);

        let path = h.handle.send_message(envelope("alice", "bob")).await.unwrap();
        assert_eq!(path, DeliveryPath::Relayed);
        assert!(link.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_without_session_message_is_relayed() {
        let mut h = harness("alice");
        let env = envelope("alice", "bob");
        let path = h.handle.send_message(env.clone()).await.unwrap();
        assert_eq!(path, DeliveryPath::Relayed);
        assert_eq!(
            h.next_emit().await,
            ClientEvent::Message {
                recipient_id: UserId::from("bob"),
                message: env,
            }
        );
    }

    #[tokio::test]
    async fn test_no_path_is_delivery_failure() {
        let h = harness("alice");
        h.status.send(ConnectionStatus::Disconnected).unwrap();

        let err = h
            .handle
            .send_message(envelope("alice", "bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::DeliveryFailure { ref peer, .. } if peer.as_str() == "bob"));
    }

    #[tokio::test]
    async fn test_unconfirmed_relay_is_delivery_failure() {
        let mut h = harness("alice");
        h.fail_relay.store(true, Ordering::SeqCst);

        let err = h
            .handle
            .send_message(envelope("alice", "bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::DeliveryFailure { ref peer, .. } if peer.as_str() == "bob"));
        assert!(matches!(h.next_emit().await, ClientEvent::Message { .. }));
    }

    #[tokio::test]
    async fn test_direct_failure_downgrades_and_relays() {
        let mut h = harness("alice");
        let link = h.connect_direct().await;
        link.fail_send.store(true, Ordering::SeqCst);

        let path = h.handle.send_message(envelope("alice", "bob")).await.unwrap();
        assert_eq!(path, DeliveryPath::Relayed);

        let s = h.handle.session(UserId::from("bob")).await.unwrap().unwrap();
        assert_eq!(s.state, SessionState::Fallback);
        assert!(link.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_negotiation_timeout_falls_back() {
        let mock = MockTransport::default();
        let h = harness_with("alice", Arc::new(mock.clone()), mock, Duration::from_millis(50));
        h.handle.join_session(UserId::from("bob")).await.unwrap();

        let s = h.wait_for("bob", SessionState::Fallback).await;
        assert_eq!(s.fallback_reason, Some(FallbackReason::NegotiationTimeout));
        assert!(h.transport.latest().closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_user_joined_retries_after_fallback() {
        let mock = MockTransport::default();
        let mut h = harness_with("alice", Arc::new(mock.clone()), mock, Duration::from_millis(50));
        h.handle.join_session(UserId::from("bob")).await.unwrap();
        h.wait_for("bob", SessionState::Fallback).await;
        let first_epoch = h.transport.latest().epoch;

        h.server(ServerEvent::UserJoined {
            user_id: UserId::from("bob"),
        })
        .await;

        // join_room, first offer, second offer
        h.next_emit().await;
        h.next_emit().await;
        assert!(matches!(h.next_emit().await, ClientEvent::Offer { .. }));
        assert_eq!(h.transport.opened(), 2);
        assert!(h.transport.latest().epoch > first_epoch);
    }

    #[tokio::test]
    async fn test_relay_only_transport_settles_in_fallback() {
        let h = harness_with(
            "alice",
            Arc::new(RelayOnly),
            MockTransport::default(),
            Duration::from_secs(30),
        );
        h.handle.join_session(UserId::from("bob")).await.unwrap();
        let s = h.wait_for("bob", SessionState::Fallback).await;
        assert!(matches!(
            s.fallback_reason,
            Some(FallbackReason::TransportUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_inbound_offer_creates_session_and_answers() {
        let mut h = harness("bob");
        h.server(ServerEvent::Offer {
            sender_id: UserId::from("alice"),
            offer: SessionDescription::offer("remote"),
        })
        .await;

        match h.next_emit().await {
            ClientEvent::Answer {
                recipient_id,
                answer,
            } => {
                assert_eq!(recipient_id.as_str(), "alice");
                assert_eq!(answer.kind, "answer");
            }
            other => panic!("expected answer, got {other:?}"),
        }
        let s = h.wait_for("alice", SessionState::Negotiating).await;
        assert_eq!(s.role, NegotiationRole::Answerer);
    }

    #[tokio::test]
    async fn test_candidates_before_answer_are_buffered() {
        let mut h = harness("alice");
        h.handle.join_session(UserId::from("bob")).await.unwrap();
        h.next_emit().await;
        h.next_emit().await;

        let bob = || UserId::from("bob");
        h.server(ServerEvent::IceCandidate {
            sender_id: bob(),
            candidate: candidate(1),
        })
        .await;
        h.server(ServerEvent::Answer {
            sender_id: bob(),
            answer: SessionDescription::answer("remote"),
        })
        .await;
        h.server(ServerEvent::IceCandidate {
            sender_id: bob(),
            candidate: candidate(2),
        })
        .await;

        let link = h.transport.latest();
        for _ in 0..200 {
            if link.candidates.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            link.candidates.lock().unwrap().clone(),
            vec![candidate(1), candidate(2)]
        );
        assert!(link.answer.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stray_candidates_are_discarded() {
        let mut h = harness("alice");
        h.server(ServerEvent::IceCandidate {
            sender_id: UserId::from("carol"),
            candidate: candidate(1),
        })
        .await;
        let link = h.connect_direct().await;
        h.server(ServerEvent::IceCandidate {
            sender_id: UserId::from("bob"),
            candidate: candidate(9),
        })
        .await;

        assert!(h.handle.session(UserId::from("carol")).await.unwrap().is_none());
        let s = h.handle.session(UserId::from("bob")).await.unwrap().unwrap();
        assert_eq!(s.state, SessionState::Connected);
        assert!(link.candidates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_answer_is_discarded() {
        let mut h = harness("alice");
        let link = h.connect_direct().await;
        h.server(ServerEvent::Answer {
            sender_id: UserId::from("bob"),
            answer: SessionDescription::answer("late"),
        })
        .await;
        let s = h.handle.session(UserId::from("bob")).await.unwrap().unwrap();
        assert_eq!(s.state, SessionState::Connected);
        assert_eq!(
            link.answer.lock().unwrap().as_ref().map(|a| a.sdp.clone()),
            Some("remote".to_string())
        );
    }

    #[tokio::test]
    async fn test_channel_close_falls_back() {
        let mut h = harness("alice");
        let link = h.connect_direct().await;
        link.emit(TransportEventKind::ChannelClosed).await;
        h.wait_for("bob", SessionState::Fallback).await;

        let env = envelope("alice", "bob");
        let path = h.handle.send_message(env.clone()).await.unwrap();
        assert_eq!(path, DeliveryPath::Relayed);
        assert!(link.sent.lock().unwrap().is_empty());
        assert_eq!(
            h.next_emit().await,
            ClientEvent::Message {
                recipient_id: UserId::from("bob"),
                message: env,
            }
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_repeatable() {
        let mut h = harness("alice");
        let link = h.connect_direct().await;

        h.handle.disconnect(UserId::from("bob")).await.unwrap();
        h.handle.disconnect(UserId::from("bob")).await.unwrap();
        h.handle.disconnect(UserId::from("nobody")).await.unwrap();

        assert!(h.handle.session(UserId::from("bob")).await.unwrap().is_none());
        assert!(link.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_disconnect_leaves_room_and_stays_closed() {
        let mut h = harness("alice");
        h.handle.join_session(UserId::from("bob")).await.unwrap();
        h.next_emit().await;
        h.next_emit().await;

        h.handle.disconnect(UserId::from("bob")).await.unwrap();
        assert_eq!(
            h.next_emit().await,
            ClientEvent::LeaveRoom {
                user_id: UserId::from("alice"),
                room: "dm:alice:bob".into(),
            }
        );

        h.server(ServerEvent::UserJoined {
            user_id: UserId::from("bob"),
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.handle.session(UserId::from("bob")).await.unwrap().is_none());
        assert_eq!(h.transport.opened(), 1);
        assert!(h.emits.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_after_close_are_ignored() {
        let mut h = harness("alice");
        h.handle.join_session(UserId::from("bob")).await.unwrap();
        h.next_emit().await;
        h.next_emit().await;
        let link = h.transport.latest();

        h.handle.disconnect(UserId::from("bob")).await.unwrap();
        link.emit(TransportEventKind::ChannelOpen).await;
        link.emit(TransportEventKind::Data(envelope("bob", "alice").to_bytes().unwrap()))
            .await;

        assert!(h.handle.session(UserId::from("bob")).await.unwrap().is_none());
        h.handle.shutdown().await;
        while let Some(notif) = h.notifs.recv().await {
            assert!(!matches!(notif, SessionNotification::Message { .. }));
            if let SessionNotification::StateChanged { state, .. } = notif {
                assert_ne!(state, SessionState::Connected);
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_all_clears_sessions() {
        let h = harness("alice");
        h.handle.join_session(UserId::from("bob")).await.unwrap();
        h.handle.join_session(UserId::from("carol")).await.unwrap();
        h.handle.disconnect_all().await.unwrap();
        h.handle.disconnect_all().await.unwrap();
        assert!(h.handle.sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inbound_messages_are_forwarded() {
        let mut h = harness("alice");
        let link = h.connect_direct().await;

        let relayed = envelope("bob", "alice");
        h.server(ServerEvent::Message(relayed.clone())).await;
        let direct = envelope("bob", "alice");
        link.emit(TransportEventKind::Data(direct.to_bytes().unwrap()))
            .await;

        let mut got = Vec::new();
        while got.len() < 2 {
            let notif = tokio::time::timeout(Duration::from_secs(2), h.notifs.recv())
                .await
                .unwrap()
                .unwrap();
            if let SessionNotification::Message { envelope, path } = notif {
                got.push((envelope, path));
            }
        }
        assert!(got.contains(&(relayed, DeliveryPath::Relayed)));
        assert!(got.contains(&(direct, DeliveryPath::Direct)));
    }

    #[tokio::test]
    async fn test_connection_lifecycle_is_forwarded() {
        let mut h = harness("alice");
        h.signaling_tx
            .send(SignalingNotification::Disconnected)
            .await
            .unwrap();
        h.signaling_tx
            .send(SignalingNotification::Reconnected)
            .await
            .unwrap();
        assert_eq!(
            h.notifs.recv().await,
            Some(SessionNotification::Connection(ConnectionStatus::Disconnected))
        );
        assert_eq!(
            h.notifs.recv().await,
            Some(SessionNotification::Connection(ConnectionStatus::Connected))
        );
    }
}
