use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use tandem_shared::protocol::IceCandidate;
use tandem_shared::UserId;

use crate::error::FallbackReason;
use crate::transport::DirectLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Negotiating,
    Connected,
    Fallback,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Negotiating)
                | (Fallback, Negotiating)
                | (Negotiating, Negotiating)
                | (Negotiating, Connected)
                | (Negotiating, Fallback)
                | (Connected, Fallback)
                | (_, Closed)
        )
    }
}

/// Which side sends the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

impl NegotiationRole {
    /// The peer whose id sorts lower offers, so two sides joining at once
    /// never both send offers.
    pub fn for_pair(local: &UserId, remote: &UserId) -> Self {
        if local < remote {
            NegotiationRole::Offerer
        } else {
            NegotiationRole::Answerer
        }
    }
}

/// Read-only view of a session handed to callers outside the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub peer: UserId,
    pub state: SessionState,
    pub role: NegotiationRole,
    /// True only while a direct data channel is open.
    pub direct_channel: bool,
    pub created_at: DateTime<Utc>,
    pub fallback_reason: Option<FallbackReason>,
}

/// Negotiation state for one remote peer. Owned by the session manager.
pub struct PeerSession {
    pub peer: UserId,
    pub role: NegotiationRole,
    pub created_at: DateTime<Utc>,
    state: SessionState,
    epoch: u64,
    link: Option<Box<dyn DirectLink>>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    timeout: Option<JoinHandle<()>>,
    fallback_reason: Option<FallbackReason>,
}

impl PeerSession {
    pub fn new(peer: UserId, role: NegotiationRole) -> Self {
        Self {
            peer,
            role,
            created_at: Utc::now(),
            state: SessionState::Idle,
            epoch: 0,
            link: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            timeout: None,
            fallback_reason: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn link(&self) -> Option<&dyn DirectLink> {
        self.link.as_deref()
    }

    pub fn set_link(&mut self, link: Box<dyn DirectLink>) {
        self.link = Some(link);
    }

    pub fn take_link(&mut self) -> Option<Box<dyn DirectLink>> {
        self.link.take()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// Start a new negotiation attempt. Anything still tied to the previous
    /// attempt (link, buffered candidates, timer) must be released by the
    /// caller first; events from it are recognised by their stale epoch.
    pub fn begin_negotiation(&mut self, epoch: u64, role: NegotiationRole) -> bool {
        if !self.state.can_transition_to(SessionState::Negotiating) {
            return false;
        }
        self.state = SessionState::Negotiating;
        self.role = role;
        self.epoch = epoch;
        self.remote_description_set = false;
        self.pending_candidates.clear();
        self.fallback_reason = None;
        debug!(peer = %self.peer.short(), epoch, role = ?role, "Negotiation started");
        true
    }

    /// The remote description is in place; returns candidates that were
    /// waiting for it.
    pub fn on_remote_description(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        std::mem::take(&mut self.pending_candidates)
    }

    pub fn buffer_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push(candidate);
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn accepts_candidates(&self) -> bool {
        self.state == SessionState::Negotiating
    }

    pub fn awaits_answer(&self) -> bool {
        self.state == SessionState::Negotiating
            && self.role == NegotiationRole::Offerer
            && self.link.is_some()
            && !self.remote_description_set
    }

    pub fn mark_connected(&mut self) -> bool {
        if !self.state.can_transition_to(SessionState::Connected) {
            return false;
        }
        self.state = SessionState::Connected;
        self.cancel_timeout();
        true
    }

    /// Move to relay delivery. The caller closes the returned link.
    pub fn fall_back(&mut self, reason: FallbackReason) -> Option<Option<Box<dyn DirectLink>>> {
        if !self.state.can_transition_to(SessionState::Fallback) {
            return None;
        }
        self.state = SessionState::Fallback;
        self.fallback_reason = Some(reason);
        self.pending_candidates.clear();
        self.cancel_timeout();
        Some(self.link.take())
    }

    /// Tear down. The caller closes the returned link.
    pub fn close(&mut self) -> Option<Box<dyn DirectLink>> {
        self.state = SessionState::Closed;
        self.pending_candidates.clear();
        self.cancel_timeout();
        self.link.take()
    }

    pub fn set_timeout(&mut self, task: JoinHandle<()>) {
        self.cancel_timeout();
        self.timeout = Some(task);
    }

    pub fn cancel_timeout(&mut self) {
        if let Some(task) = self.timeout.take() {
            task.abort();
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            peer: self.peer.clone(),
            state: self.state,
            role: self.role,
            direct_channel: self.state == SessionState::Connected && self.link.is_some(),
            created_at: self.created_at,
            fallback_reason: self.fallback_reason.clone(),
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.cancel_timeout();
    }
}
