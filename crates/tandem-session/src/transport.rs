//! Direct (peer-to-peer) transport seam.
//!
//! The session manager only talks to these traits. [`crate::webrtc_peer`]
//! implements them on top of WebRTC data channels; [`RelayOnly`] disables
//! direct transport so every session settles in relay delivery.

use async_trait::async_trait;
use tokio::sync::mpsc;

use tandem_shared::protocol::{IceCandidate, SessionDescription};
use tandem_shared::UserId;

use crate::error::TransportError;

/// Something the direct transport observed for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub peer: UserId,
    /// Negotiation attempt the emitting link belongs to.
    pub epoch: u64,
    pub kind: TransportEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// A local ICE candidate to trickle to the peer.
    LocalCandidate(IceCandidate),
    ChannelOpen,
    ChannelClosed,
    ChannelError(String),
    Data(Vec<u8>),
}

impl TransportEvent {
    pub fn new(peer: UserId, epoch: u64, kind: TransportEventKind) -> Self {
        Self { peer, epoch, kind }
    }
}

/// One negotiation attempt with one peer.
#[async_trait]
pub trait DirectLink: Send + Sync {
    /// Open the data channel and produce the local offer.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a remote offer and produce the local answer.
    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), TransportError>;

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    fn is_writable(&self) -> bool;

    /// Release the underlying connection. Must be safe to call twice.
    async fn close(&self);
}

#[async_trait]
pub trait DirectTransport: Send + Sync {
    /// Create a fresh link for `peer`. Everything the link observes is
    /// reported on `events`, tagged with `epoch`.
    async fn open(
        &self,
        peer: &UserId,
        epoch: u64,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn DirectLink>, TransportError>;
}

/// Transport that never opens a direct channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayOnly;

#[async_trait]
impl DirectTransport for RelayOnly {
    async fn open(
        &self,
        _peer: &UserId,
        _epoch: u64,
        _events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn DirectLink>, TransportError> {
        Err(TransportError::Disabled)
    }
}
