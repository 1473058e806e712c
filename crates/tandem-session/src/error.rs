use thiserror::Error;

use tandem_shared::{ProtocolError, UserId};

/// Errors surfaced to callers of the session layer.
///
/// Negotiation problems never show up here; they downgrade the session to
/// relay delivery and are reported as a [`FallbackReason`] instead.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Delivery to {peer} failed: {reason}")]
    DeliveryFailure { peer: UserId, reason: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] ProtocolError),

    #[error("Session manager has shut down")]
    ManagerClosed,
}

impl SessionError {
    pub(crate) fn delivery_failure(peer: &UserId, reason: impl std::fmt::Display) -> Self {
        SessionError::DeliveryFailure {
            peer: peer.clone(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Data channel is not open")]
    NotOpen,

    #[error("Direct transport is disabled")]
    Disabled,

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),
}

impl From<webrtc::Error> for TransportError {
    fn from(e: webrtc::Error) -> Self {
        TransportError::WebRtc(e.to_string())
    }
}

/// Why a session stopped using (or never reached) the direct channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    NegotiationTimeout,
    NegotiationFailed(String),
    TransportUnavailable(String),
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackReason::NegotiationTimeout => f.write_str("negotiation timed out"),
            FallbackReason::NegotiationFailed(e) => write!(f, "negotiation failed: {e}"),
            FallbackReason::TransportUnavailable(e) => write!(f, "transport unavailable: {e}"),
        }
    }
}
