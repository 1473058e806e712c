//! WebRTC data channel transport.
//!
//! Each [`DirectLink`] wraps one `RTCPeerConnection` carrying a single
//! ordered data channel labelled [`DATA_CHANNEL_LABEL`]. The offerer creates
//! the channel, the answerer receives it through `on_data_channel`.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use tandem_shared::constants::{DATA_CHANNEL_LABEL, DEFAULT_STUN_SERVER};
use tandem_shared::protocol::{IceCandidate, SessionDescription};
use tandem_shared::UserId;

use crate::error::TransportError;
use crate::transport::{DirectLink, DirectTransport, TransportEvent, TransportEventKind};

/// Opens WebRTC links using the configured ICE servers.
#[derive(Debug, Clone)]
pub struct WebRtcTransport {
    ice_servers: Vec<String>,
}

impl WebRtcTransport {
    pub fn new(ice_servers: Vec<String>) -> Self {
        let ice_servers = if ice_servers.is_empty() {
            vec![DEFAULT_STUN_SERVER.to_string()]
        } else {
            ice_servers
        };
        Self { ice_servers }
    }

    fn build_api() -> Result<API, TransportError> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        Ok(APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build())
    }
}

impl Default for WebRtcTransport {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl DirectTransport for WebRtcTransport {
    async fn open(
        &self,
        peer: &UserId,
        epoch: u64,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn DirectLink>, TransportError> {
        let api = Self::build_api()?;
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let emitter = Emitter {
            peer: peer.clone(),
            epoch,
            tx: events,
        };
        let channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>> = Arc::new(RwLock::new(None));

        let em = emitter.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let em = em.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        em.emit(TransportEventKind::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        }))
                        .await
                    }
                    Err(e) => debug!(error = %e, "Could not serialize local candidate"),
                }
            })
        }));

        let em = emitter.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let em = em.clone();
            Box::pin(async move {
                debug!(peer = %em.peer.short(), ?state, "Peer connection state");
                if state == RTCPeerConnectionState::Failed {
                    em.emit(TransportEventKind::ChannelError("peer connection failed".into()))
                        .await;
                }
            })
        }));

        let em = emitter.clone();
        let slot = channel.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let em = em.clone();
            let slot = slot.clone();
            Box::pin(async move {
                if dc.label() != DATA_CHANNEL_LABEL {
                    warn!(label = %dc.label(), "Ignoring unexpected data channel");
                    return;
                }
                attach_channel(&dc, &em);
                if let Ok(mut guard) = slot.write() {
                    *guard = Some(dc);
                }
            })
        }));

        Ok(Box::new(WebRtcLink {
            pc,
            channel,
            emitter,
        }))
    }
}

#[derive(Clone)]
struct Emitter {
    peer: UserId,
    epoch: u64,
    tx: mpsc::Sender<TransportEvent>,
}

impl Emitter {
    async fn emit(&self, kind: TransportEventKind) {
        let _ = self
            .tx
            .send(TransportEvent::new(self.peer.clone(), self.epoch, kind))
            .await;
    }
}

fn attach_channel(dc: &Arc<RTCDataChannel>, emitter: &Emitter) {
    let em = emitter.clone();
    dc.on_open(Box::new(move || {
        let em = em.clone();
        Box::pin(async move { em.emit(TransportEventKind::ChannelOpen).await })
    }));

    let em = emitter.clone();
    dc.on_close(Box::new(move || {
        let em = em.clone();
        Box::pin(async move { em.emit(TransportEventKind::ChannelClosed).await })
    }));

    let em = emitter.clone();
    dc.on_error(Box::new(move |err: webrtc::Error| {
        let em = em.clone();
        Box::pin(async move {
            em.emit(TransportEventKind::ChannelError(err.to_string()))
                .await
        })
    }));

    let em = emitter.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let em = em.clone();
        Box::pin(async move { em.emit(TransportEventKind::Data(msg.data.to_vec())).await })
    }));
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    emitter: Emitter,
}

impl WebRtcLink {
    fn data_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.read().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait]
impl DirectLink for WebRtcLink {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let dc = self.pc.create_data_channel(DATA_CHANNEL_LABEL, None).await?;
        attach_channel(&dc, &self.emitter);
        if let Ok(mut guard) = self.channel.write() {
            *guard = Some(dc);
        }

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let remote = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc.set_remote_description(remote).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), TransportError> {
        let remote = RTCSessionDescription::answer(answer.sdp.clone())
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc.set_remote_description(remote).await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let dc = self.data_channel().ok_or(TransportError::NotOpen)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::NotOpen);
        }
        dc.send(&Bytes::copy_from_slice(data)).await?;
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.data_channel()
            .map(|dc| dc.ready_state() == RTCDataChannelState::Open)
            .unwrap_or(false)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(peer = %self.emitter.peer.short(), error = %e, "Error closing peer connection");
        }
    }
}
