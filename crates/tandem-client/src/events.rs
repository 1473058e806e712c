use serde::Serialize;

use tandem_session::SessionState;
use tandem_shared::{ConnectionStatus, DeliveryPath, MessageId, UserId};

use crate::conversation::Message;

pub const EVENT_MESSAGE_RECEIVED: &str = "message-received";
pub const EVENT_PROFILE_UPDATED: &str = "profile-updated";
pub const EVENT_SESSION_CHANGED: &str = "session-changed";
pub const EVENT_CONNECTION_CHANGED: &str = "connection-changed";
pub const EVENT_DECRYPTION_FAILED: &str = "decryption-failed";

/// Events the client pushes to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    MessageReceived {
        message: Message,
        path: DeliveryPath,
    },
    ProfileUpdated {
        user_id: UserId,
        profile_picture: String,
    },
    SessionChanged {
        peer: UserId,
        state: SessionState,
        /// Why the session is not using the direct channel, if it is not.
        reason: Option<String>,
    },
    ConnectionChanged {
        status: ConnectionStatus,
    },
    /// An inbound message could not be decrypted. It is kept with
    /// placeholder content.
    DecryptionFailed {
        message_id: MessageId,
        sender_id: UserId,
        reason: String,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::MessageReceived { .. } => EVENT_MESSAGE_RECEIVED,
            ClientEvent::ProfileUpdated { .. } => EVENT_PROFILE_UPDATED,
            ClientEvent::SessionChanged { .. } => EVENT_SESSION_CHANGED,
            ClientEvent::ConnectionChanged { .. } => EVENT_CONNECTION_CHANGED,
            ClientEvent::DecryptionFailed { .. } => EVENT_DECRYPTION_FAILED,
        }
    }
}
