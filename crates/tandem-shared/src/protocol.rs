use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::ProtocolError;
use crate::types::{MessageId, UserId};

/// An encrypted chat message, as carried by both the data channel and the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatEnvelope {
    /// Message id for deduplication
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    /// Ciphertext (base64 nonce || XChaCha20-Poly1305 output)
    pub message: String,
    /// Timestamp as reported by the sender
    pub timestamp: DateTime<Utc>,
}

impl ChatEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = serde_json::to_vec(self)?;
        check_size(bytes.len())?;
        Ok(bytes)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_size(data.len())?;
        Ok(serde_json::from_slice(data)?)
    }
}

/// SDP offer or answer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".into(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".into(),
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    pub user_id: UserId,
    pub profile_picture: String,
}

/// Events a client emits on the signaling connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom {
        user_id: UserId,
        room: String,
    },
    LeaveRoom {
        user_id: UserId,
        room: String,
    },
    Offer {
        recipient_id: UserId,
        offer: SessionDescription,
    },
    Answer {
        recipient_id: UserId,
        answer: SessionDescription,
    },
    IceCandidate {
        recipient_id: UserId,
        candidate: IceCandidate,
    },
    /// Relay fallback
    Message {
        recipient_id: UserId,
        message: ChatEnvelope,
    },
    ProfileUpdate(ProfileUpdate),
}

/// Events the rendezvous server delivers to a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    UserJoined {
        user_id: UserId,
    },
    Offer {
        sender_id: UserId,
        offer: SessionDescription,
    },
    Answer {
        sender_id: UserId,
        answer: SessionDescription,
    },
    IceCandidate {
        sender_id: UserId,
        candidate: IceCandidate,
    },
    Message(ChatEnvelope),
    ProfileUpdate(ProfileUpdate),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom { .. } => "join_room",
            ClientEvent::LeaveRoom { .. } => "leave_room",
            ClientEvent::Offer { .. } => "offer",
            ClientEvent::Answer { .. } => "answer",
            ClientEvent::IceCandidate { .. } => "ice_candidate",
            ClientEvent::Message { .. } => "message",
            ClientEvent::ProfileUpdate(_) => "profile_update",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let json = serde_json::to_string(self)?;
        check_size(json.len())?;
        Ok(json)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        check_size(text.len())?;
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::UserJoined { .. } => "user_joined",
            ServerEvent::Offer { .. } => "offer",
            ServerEvent::Answer { .. } => "answer",
            ServerEvent::IceCandidate { .. } => "ice_candidate",
            ServerEvent::Message(_) => "message",
            ServerEvent::ProfileUpdate(_) => "profile_update",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        check_size(text.len())?;
        Ok(serde_json::from_str(text)?)
    }
}

fn check_size(size: usize) -> Result<(), ProtocolError> {
    if size > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}
