//! Per-peer session management: direct WebRTC data channels with relay
//! fallback over the signaling connection.

pub mod error;
pub mod manager;
pub mod session;
pub mod transport;
pub mod webrtc_peer;

pub use error::{FallbackReason, SessionError, TransportError};
pub use manager::{
    spawn_session_manager, SessionCommand, SessionConfig, SessionHandle, SessionNotification,
};
pub use session::{NegotiationRole, SessionSnapshot, SessionState};
pub use transport::{DirectLink, DirectTransport, RelayOnly, TransportEvent, TransportEventKind};
pub use webrtc_peer::WebRtcTransport;
