//! Inbound bridge: turns session notifications into conversation updates
//! and UI events.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tandem_session::SessionNotification;
use tandem_shared::protocol::ChatEnvelope;
use tandem_shared::{DeliveryPath, UserId};

use crate::conversation::{ConversationStore, Message};
use crate::events::ClientEvent;
use crate::keys::{KeyRing, UNDECRYPTABLE_PLACEHOLDER};

pub(crate) struct Bridge {
    pub local: UserId,
    pub keys: Arc<KeyRing>,
    pub conversations: ConversationStore,
    pub event_tx: mpsc::Sender<ClientEvent>,
}

impl Bridge {
    pub fn spawn(self, notif_rx: mpsc::Receiver<SessionNotification>) -> JoinHandle<()> {
        tokio::spawn(self.notification_loop(notif_rx))
    }

    async fn notification_loop(self, mut notif_rx: mpsc::Receiver<SessionNotification>) {
        info!(user = %self.local.short(), "Session bridge started");

        while let Some(notification) = notif_rx.recv().await {
            match notification {
                SessionNotification::Message { envelope, path } => {
                    self.handle_envelope(envelope, path).await;
                }

                SessionNotification::ProfileUpdate(update) => {
                    self.keys
                        .set_profile_picture(&update.user_id, &update.profile_picture)
                        .await;
                    self.emit(ClientEvent::ProfileUpdated {
                        user_id: update.user_id,
                        profile_picture: update.profile_picture,
                    })
                    .await;
                }

                SessionNotification::StateChanged {
                    peer,
                    state,
                    reason,
                } => {
                    debug!(peer = %peer.short(), ?state, "Session state (bridge)");
                    self.emit(ClientEvent::SessionChanged {
                        peer,
                        state,
                        reason: reason.map(|r| r.to_string()),
                    })
                    .await;
                }

                SessionNotification::Connection(status) => {
                    info!(?status, "Signaling connection (bridge)");
                    self.emit(ClientEvent::ConnectionChanged { status }).await;
                }

                SessionNotification::SignalingError(e) => {
                    warn!(error = %e, "Signaling error");
                }
            }
        }

        info!("Session bridge stopped");
    }

    async fn handle_envelope(&self, envelope: ChatEnvelope, path: DeliveryPath) {
        if envelope.recipient_id != self.local {
            debug!(recipient = %envelope.recipient_id.short(), "Envelope not addressed to us");
            return;
        }

        let (content, failure) = match self
            .keys
            .decrypt_from(&envelope.sender_id, &envelope.message)
            .await
        {
            Ok(plaintext) => (plaintext, None),
            Err(e) => (UNDECRYPTABLE_PLACEHOLDER.to_string(), Some(e.to_string())),
        };

        let message = Message {
            id: envelope.id,
            sender_id: envelope.sender_id,
            recipient_id: envelope.recipient_id,
            content,
            timestamp: envelope.timestamp,
            viewed: false,
        };

        if !self.conversations.apply_incoming(message.clone()) {
            debug!(id = %message.id, "Inbound message ignored");
            return;
        }

        match failure {
            None => {
                debug!(from = %message.sender_id.short(), ?path, "Message received");
                self.emit(ClientEvent::MessageReceived { message, path }).await;
            }
            Some(reason) => {
                warn!(from = %message.sender_id.short(), error = %reason, "Could not decrypt message");
                self.emit(ClientEvent::DecryptionFailed {
                    message_id: message.id,
                    sender_id: message.sender_id,
                    reason,
                })
                .await;
            }
        }
    }

    async fn emit(&self, event: ClientEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("Client event receiver dropped");
        }
    }
}
