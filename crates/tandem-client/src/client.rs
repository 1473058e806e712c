//! The explicit client context.
//!
//! A [`Client`] owns everything one logged-in identity needs: credentials,
//! the signaling connection, the session manager, conversation state and
//! the inbound bridge. Several clients can live in one process.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tandem_net::{spawn_signaling, SignalingConfig, SignalingHandle, SignalingNotification};
use tandem_session::{
    spawn_session_manager, DirectTransport, SessionConfig, SessionHandle, SessionSnapshot,
    WebRtcTransport,
};
use tandem_shared::protocol::{self, ChatEnvelope, ProfileUpdate};
use tandem_shared::{MessageId, UserId};

use crate::api::{ChatApi, UserProfile};
use crate::bridge::Bridge;
use crate::config::ClientConfig;
use crate::conversation::{ConversationStore, ConversationSummary, Message};
use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::keys::{decrypt_or_placeholder, KeyRing};
use crate::storage::{Credentials, SecureStore};

pub struct Client {
    credentials: Credentials,
    api: Arc<dyn ChatApi>,
    store: Arc<dyn SecureStore>,
    keys: Arc<KeyRing>,
    conversations: ConversationStore,
    signaling: SignalingHandle,
    sessions: SessionHandle,
    bridge: JoinHandle<()>,
}

impl Client {
    /// Load credentials, connect to the rendezvous server and start the
    /// session layer over WebRTC.
    pub async fn connect(
        config: ClientConfig,
        api: Arc<dyn ChatApi>,
        store: Arc<dyn SecureStore>,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), ClientError> {
        let credentials = Credentials::load(store.as_ref())
            .await?
            .ok_or(ClientError::NotLoggedIn)?;

        let signaling_config =
            SignalingConfig::new(config.signaling_url.clone(), credentials.user_id.clone())
                .with_token(credentials.token.clone());
        let (signaling, signaling_rx) = spawn_signaling(signaling_config).await?;
        let transport = Arc::new(WebRtcTransport::new(config.ice_servers.clone()));

        Ok(Self::assemble(
            &config,
            credentials,
            api,
            store,
            signaling,
            signaling_rx,
            transport,
        ))
    }

    /// Build a client around an existing signaling handle and transport.
    pub fn assemble(
        config: &ClientConfig,
        credentials: Credentials,
        api: Arc<dyn ChatApi>,
        store: Arc<dyn SecureStore>,
        signaling: SignalingHandle,
        signaling_rx: mpsc::Receiver<SignalingNotification>,
        transport: Arc<dyn DirectTransport>,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        let local = credentials.user_id.clone();
        let keys = Arc::new(KeyRing::new(
            credentials.private_key.clone(),
            credentials.token.clone(),
            api.clone(),
        ));
        let conversations = ConversationStore::new(local.clone());

        let (sessions, notif_rx) = spawn_session_manager(
            signaling.clone(),
            signaling_rx,
            transport,
            SessionConfig {
                negotiation_timeout: config.negotiation_timeout,
            },
        );

        let (event_tx, event_rx) = mpsc::channel(256);
        let bridge = Bridge {
            local: local.clone(),
            keys: keys.clone(),
            conversations: conversations.clone(),
            event_tx,
        }
        .spawn(notif_rx);

        info!(user = %local.short(), "Client ready");

        (
            Self {
                credentials,
                api,
                store,
                keys,
                conversations,
                signaling,
                sessions,
                bridge,
            },
            event_rx,
        )
    }

    pub fn local_user(&self) -> &UserId {
        &self.credentials.user_id
    }

    /// Refetch history and partner profiles and replace local state with
    /// them. Each partner's profile is fetched once. Bodies that cannot be
    /// decrypted are kept as a placeholder.
    pub async fn refresh(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        let local = self.local_user();
        let records = self
            .api
            .fetch_messages(&self.credentials.token, local)
            .await?;

        let partners: BTreeSet<UserId> = records
            .iter()
            .filter(|r| &r.sender_id == local || &r.recipient_id == local)
            .map(|r| {
                if &r.sender_id == local {
                    r.recipient_id.clone()
                } else {
                    r.sender_id.clone()
                }
            })
            .collect();
        let mut secrets = HashMap::with_capacity(partners.len());
        for partner in &partners {
            if let Err(e) = self.keys.refresh_profile(partner).await {
                warn!(partner = %partner.short(), error = %e, "Could not fetch profile");
            }
            let secret = match self.keys.known_secret_for(partner).await {
                Ok(secret) => Some(secret),
                Err(e) => {
                    debug!(partner = %partner.short(), error = %e, "History will show placeholders");
                    None
                }
            };
            secrets.insert(partner.clone(), secret);
        }

        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            let partner = if &record.sender_id == local {
                &record.recipient_id
            } else {
                &record.sender_id
            };
            let secret = secrets.get(partner).and_then(Option::as_ref);
            let content = decrypt_or_placeholder(secret, &record.message);
            messages.push(Message {
                id: record.id,
                sender_id: record.sender_id,
                recipient_id: record.recipient_id,
                content,
                timestamp: record.timestamp,
                viewed: record.viewed,
            });
        }

        debug!(count = messages.len(), partners = partners.len(), "History refreshed");
        self.conversations.apply_snapshot(messages);
        Ok(self.conversations.summaries())
    }

    /// Open a conversation: make sure it can be encrypted, start a session
    /// and mark everything unread in it as viewed.
    pub async fn open_conversation(&self, partner: &UserId) -> Result<Vec<Message>, ClientError> {
        self.keys.secret_for(partner).await?;
        self.sessions.join_session(partner.clone()).await?;

        for id in self.conversations.mark_conversation_viewed(partner) {
            if let Err(e) = self.api.mark_viewed(&self.credentials.token, &id).await {
                warn!(id = %id, error = %e, "Could not mark message viewed");
            }
        }
        Ok(self.conversations.messages(partner))
    }

    /// Encrypt and deliver a message. Plaintext never leaves the client:
    /// without key material nothing is sent.
    pub async fn send_message(&self, partner: &UserId, text: &str) -> Result<Message, ClientError> {
        let ciphertext = self.keys.encrypt_for(partner, text).await?;
        let envelope = ChatEnvelope {
            id: MessageId::new(),
            sender_id: self.local_user().clone(),
            recipient_id: partner.clone(),
            message: ciphertext,
            timestamp: Utc::now(),
        };
        let message = Message {
            id: envelope.id.clone(),
            sender_id: envelope.sender_id.clone(),
            recipient_id: envelope.recipient_id.clone(),
            content: text.to_string(),
            timestamp: envelope.timestamp,
            viewed: false,
        };

        let path = self.sessions.send_message(envelope).await?;
        debug!(peer = %partner.short(), ?path, id = %message.id, "Message sent");

        self.conversations.record_outgoing(message.clone());
        Ok(message)
    }

    /// Mark one message viewed locally and on the server. Unknown or
    /// already viewed ids do nothing.
    pub async fn mark_viewed(&self, id: &MessageId) -> Result<bool, ClientError> {
        if !self.conversations.mark_viewed(id) {
            return Ok(false);
        }
        self.api.mark_viewed(&self.credentials.token, id).await?;
        Ok(true)
    }

    /// Broadcast a new profile picture to other users.
    pub async fn update_profile(&self, profile_picture: &str) -> Result<(), ClientError> {
        self.signaling
            .emit(protocol::ClientEvent::ProfileUpdate(ProfileUpdate {
                user_id: self.local_user().clone(),
                profile_picture: profile_picture.to_string(),
            }))
            .await?;
        self.keys
            .set_profile_picture(self.local_user(), profile_picture)
            .await;
        Ok(())
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<UserProfile>, ClientError> {
        Ok(self.api.search_users(&self.credentials.token, query).await?)
    }

    pub async fn profile(&self, user: &UserId) -> Result<UserProfile, ClientError> {
        self.keys.profile(user).await
    }

    pub fn summaries(&self) -> Vec<ConversationSummary> {
        self.conversations.summaries()
    }

    pub fn messages(&self, partner: &UserId) -> Vec<Message> {
        self.conversations.messages(partner)
    }

    pub async fn sessions(&self) -> Result<Vec<SessionSnapshot>, ClientError> {
        Ok(self.sessions.sessions().await?)
    }

    /// Close every session, drop the connection and forget credentials.
    pub async fn logout(self) -> Result<(), ClientError> {
        info!(user = %self.local_user().short(), "Logging out");
        if let Err(e) = self.sessions.disconnect_all().await {
            warn!(error = %e, "Could not close sessions");
        }
        self.sessions.shutdown().await;
        self.signaling.shutdown().await;
        self.keys.clear().await;
        self.bridge.abort();
        Credentials::clear(self.store.as_ref()).await?;
        Ok(())
    }
}
