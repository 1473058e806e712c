//! Signaling hub: live connections per user and room membership.
//!
//! The hub never looks inside offers, answers or relayed envelopes. It
//! only rewrites the sender to the connection's user before forwarding.
//! Relayed envelopes for a user with no live connection wait in that
//! user's mailbox and are flushed when they next connect.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use tandem_shared::protocol::{ChatEnvelope, ClientEvent, ServerEvent};
use tandem_shared::UserId;

use crate::error::ServerError;

/// Queued events per connection before a slow client starts losing them.
const OUTBOX_CAPACITY: usize = 256;

/// Envelopes held per offline user. Must stay below `OUTBOX_CAPACITY` so a
/// flush always fits into a fresh outbox.
const MAILBOX_CAPACITY: usize = 128;

pub type ConnectionId = u64;

#[derive(Default)]
struct HubState {
    /// A user may be connected from several devices at once.
    connections: HashMap<UserId, HashMap<ConnectionId, mpsc::Sender<ServerEvent>>>,
    rooms: HashMap<String, HashSet<UserId>>,
    mailboxes: HashMap<UserId, VecDeque<ChatEnvelope>>,
    next_connection: ConnectionId,
}

impl HubState {
    fn deliver(&self, user: &UserId, event: &ServerEvent) -> bool {
        let Some(outboxes) = self.connections.get(user) else {
            return false;
        };
        for (id, tx) in outboxes {
            if tx.try_send(event.clone()).is_err() {
                debug!(
                    target_user = %user.short(),
                    connection = id,
                    event = event.name(),
                    "Dropping event for slow connection"
                );
            }
        }
        true
    }
}

#[derive(Clone)]
pub struct Hub {
    state: Arc<RwLock<HubState>>,
    max_peers: usize,
}

impl Hub {
    /// `max_peers` caps distinct connected users. 0 means unlimited.
    pub fn new(max_peers: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(HubState::default())),
            max_peers,
        }
    }

    /// Register a connection. Returns its id and the receiver of events
    /// addressed to it.
    pub async fn connect(
        &self,
        user: &UserId,
    ) -> Result<(ConnectionId, mpsc::Receiver<ServerEvent>), ServerError> {
        let mut state = self.state.write().await;
        if self.max_peers > 0
            && !state.connections.contains_key(user)
            && state.connections.len() >= self.max_peers
        {
            return Err(ServerError::Full {
                max: self.max_peers,
            });
        }

        let id = state.next_connection;
        state.next_connection += 1;

        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        if let Some(held) = state.mailboxes.remove(user) {
            info!(user = %user.short(), count = held.len(), "Delivering held messages");
            for envelope in held {
                if tx.try_send(ServerEvent::Message(envelope)).is_err() {
                    warn!(user = %user.short(), "Outbox full while flushing mailbox");
                }
            }
        }
        state
            .connections
            .entry(user.clone())
            .or_default()
            .insert(id, tx);

        info!(
            user = %user.short(),
            connection = id,
            users = state.connections.len(),
            "Client connected"
        );
        Ok((id, rx))
    }

    /// Remove a connection. With the user's last connection gone, their
    /// room memberships go too and empty rooms are deleted. Their mailbox
    /// is kept.
    pub async fn disconnect(&self, user: &UserId, connection: ConnectionId) {
        let mut state = self.state.write().await;

        let last = match state.connections.get_mut(user) {
            Some(outboxes) => {
                outboxes.remove(&connection);
                outboxes.is_empty()
            }
            None => return,
        };
        if !last {
            debug!(user = %user.short(), connection, "Connection closed, user still online");
            return;
        }

        state.connections.remove(user);
        state.rooms.retain(|room, members| {
            members.remove(user);
            if members.is_empty() {
                debug!(room = %room, "Removed empty room");
            }
            !members.is_empty()
        });

        info!(
            user = %user.short(),
            users = state.connections.len(),
            "Client disconnected"
        );
    }

    /// Apply one event from `sender`'s connection.
    pub async fn dispatch(&self, sender: &UserId, event: ClientEvent) {
        match event {
            ClientEvent::JoinRoom { user_id, room } => {
                if &user_id != sender {
                    warn!(
                        user = %sender.short(),
                        claimed = %user_id.short(),
                        "join_room for another user, using connection identity"
                    );
                }
                self.join_room(sender, &room).await;
            }

            ClientEvent::LeaveRoom { user_id, room } => {
                if &user_id != sender {
                    warn!(
                        user = %sender.short(),
                        claimed = %user_id.short(),
                        "leave_room for another user, using connection identity"
                    );
                }
                self.leave_room(sender, &room).await;
            }

            ClientEvent::Offer {
                recipient_id,
                offer,
            } => {
                self.forward(
                    &recipient_id,
                    ServerEvent::Offer {
                        sender_id: sender.clone(),
                        offer,
                    },
                )
                .await;
            }

            ClientEvent::Answer {
                recipient_id,
                answer,
            } => {
                self.forward(
                    &recipient_id,
                    ServerEvent::Answer {
                        sender_id: sender.clone(),
                        answer,
                    },
                )
                .await;
            }

            ClientEvent::IceCandidate {
                recipient_id,
                candidate,
            } => {
                self.forward(
                    &recipient_id,
                    ServerEvent::IceCandidate {
                        sender_id: sender.clone(),
                        candidate,
                    },
                )
                .await;
            }

            ClientEvent::Message {
                recipient_id,
                mut message,
            } => {
                message.sender_id = sender.clone();
                message.recipient_id = recipient_id;
                self.relay(message).await;
            }

            ClientEvent::ProfileUpdate(mut update) => {
                update.user_id = sender.clone();
                self.broadcast_except(sender, ServerEvent::ProfileUpdate(update))
                    .await;
            }
        }
    }

    /// Add `user` to `room` and tell the other members.
    pub async fn join_room(&self, user: &UserId, room: &str) {
        let mut state = self.state.write().await;
        let members = state.rooms.entry(room.to_string()).or_default();
        if !members.insert(user.clone()) {
            debug!(user = %user.short(), room = %room, "Already in room, notifying again");
        }
        let others: Vec<UserId> = members.iter().filter(|m| *m != user).cloned().collect();

        let event = ServerEvent::UserJoined {
            user_id: user.clone(),
        };
        for member in &others {
            state.deliver(member, &event);
        }

        info!(
            user = %user.short(),
            room = %room,
            members = others.len() + 1,
            "Joined room"
        );
    }

    /// Remove `user` from `room`, deleting the room once empty.
    pub async fn leave_room(&self, user: &UserId, room: &str) {
        let mut state = self.state.write().await;
        let Some(members) = state.rooms.get_mut(room) else {
            debug!(user = %user.short(), room = %room, "Leave for unknown room");
            return;
        };
        members.remove(user);
        let remaining = members.len();
        if remaining == 0 {
            state.rooms.remove(room);
            debug!(room = %room, "Removed empty room");
        }

        info!(user = %user.short(), room = %room, members = remaining, "Left room");
    }

    /// Deliver a relayed envelope to every connection of its recipient.
    /// With the recipient offline it goes to their mailbox instead, and the
    /// oldest held envelope is dropped once the mailbox is full. Returns
    /// whether it was delivered now.
    pub async fn relay(&self, envelope: ChatEnvelope) -> bool {
        let mut state = self.state.write().await;
        let recipient = envelope.recipient_id.clone();
        if state.deliver(&recipient, &ServerEvent::Message(envelope.clone())) {
            debug!(target_user = %recipient.short(), id = %envelope.id, "Relayed");
            return true;
        }

        let mailbox = state.mailboxes.entry(recipient.clone()).or_default();
        if mailbox.len() >= MAILBOX_CAPACITY {
            if let Some(dropped) = mailbox.pop_front() {
                warn!(target_user = %recipient.short(), id = %dropped.id, "Mailbox full, dropped oldest");
            }
        }
        mailbox.push_back(envelope);
        debug!(target_user = %recipient.short(), held = mailbox.len(), "Recipient offline, message held");
        false
    }

    /// Send an event to every connection of `recipient`. Returns false
    /// when the recipient is offline; the event is dropped.
    pub async fn forward(&self, recipient: &UserId, event: ServerEvent) -> bool {
        let state = self.state.read().await;
        let delivered = state.deliver(recipient, &event);
        if delivered {
            debug!(target_user = %recipient.short(), event = event.name(), "Forwarded");
        } else {
            debug!(target_user = %recipient.short(), event = event.name(), "Recipient offline, dropped");
        }
        delivered
    }

    pub async fn broadcast_except(&self, sender: &UserId, event: ServerEvent) {
        let state = self.state.read().await;
        let mut count = 0;
        for user in state.connections.keys().filter(|u| *u != sender) {
            if state.deliver(user, &event) {
                count += 1;
            }
        }
        debug!(event = event.name(), recipients = count, "Broadcast");
    }

    pub async fn connected_users(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn room_members(&self, room: &str) -> HashSet<UserId> {
        self.state
            .read()
            .await
            .rooms
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    pub async fn held_messages(&self, user: &UserId) -> usize {
        self.state
            .read()
            .await
            .mailboxes
            .get(user)
            .map_or(0, VecDeque::len)
    }
}
