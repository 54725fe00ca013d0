//! [`PeerTransport`] backed by a webrtc-rs peer connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::ice::IceServer;
use crate::media::{MediaHandle, RemoteMedia};
use crate::message::{IceCandidate, SdpKind, SessionDescription};
use crate::transport::{
    LinkState, NegotiationState, PeerTransport, PeerTransportFactory, TransportError,
    TransportEvent, TransportEvents,
};

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn to_negotiation_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub struct WebRtcTransportFactory {
    api: API,
}

impl WebRtcTransportFactory {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_settings(SettingEngine::default())
    }

    pub fn with_settings(setting: SettingEngine) -> Result<Self, TransportError> {
        Ok(Self {
            api: build_api(setting)?,
        })
    }
}

fn rtc_ice_servers(servers: Vec<IceServer>) -> Vec<RTCIceServer> {
    servers
        .into_iter()
        .map(|server| RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        ice_servers: Vec<IceServer>,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        events.emit(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        warn!(
                            target = "webrtc",
                            connection_id = %events.connection_id(),
                            error = %err,
                            "failed to serialize local candidate"
                        );
                    }
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            Box::pin(async move {
                debug!(
                    target = "webrtc",
                    connection_id = %events.connection_id(),
                    ?state,
                    "peer connection state changed"
                );
                if let Some(state) = link_state(state) {
                    events.emit(TransportEvent::StateChanged(state));
                }
            })
        }));

        let track_events = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            Box::pin(async move {
                trace!(
                    target = "webrtc",
                    connection_id = %events.connection_id(),
                    track_id = %track.id(),
                    "remote track arrived"
                );
                events.emit(TransportEvent::RemoteMedia(RemoteMedia::new(vec![track])));
            })
        }));

        Ok(Arc::new(WebRtcPeer {
            pc,
            closed: AtomicBool::new(false),
        }))
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(to_negotiation_error)
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn attach_media(&self, media: &MediaHandle) -> Result<(), TransportError> {
        self.ensure_open()?;
        for track in media.tracks() {
            let sender = self
                .pc
                .add_track(Arc::clone(track))
                .await
                .map_err(|err| TransportError::Media(err.to_string()))?;
            // RTCP has to be read for the interceptors to do their work.
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(to_negotiation_error)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_negotiation_error)
    }

    fn negotiation_state(&self) -> NegotiationState {
        if self.closed.load(Ordering::Acquire) {
            return NegotiationState::Closed;
        }
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                NegotiationState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                NegotiationState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => NegotiationState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => NegotiationState::Stable,
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pc.close().await.map_err(to_setup_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_servers_map_missing_credentials_to_empty() {
        let servers = rtc_ice_servers(vec![
            IceServer::stun("stun:stun.l.google.com:19302"),
            IceServer {
                urls: vec!["turn:turn.example.org:3478".into()],
                username: Some("user".into()),
                credential: Some("secret".into()),
            },
        ]);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "secret");
    }

    #[test]
    fn unspecified_peer_state_is_not_reported() {
        assert_eq!(link_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(
            link_state(RTCPeerConnectionState::Failed),
            Some(LinkState::Failed)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_is_idempotent() {
        let factory = WebRtcTransportFactory::new().expect("api");
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let id = crate::ids::ConnectionId::outgoing(
            &"alice".into(),
            &"bob".into(),
            crate::ids::StreamKind::Camera,
        );
        let transport = factory
            .create(Vec::new(), TransportEvents::new(id, 0, tx))
            .await
            .expect("peer connection");
        assert_eq!(transport.negotiation_state(), NegotiationState::Stable);
        transport.close().await.expect("close");
        transport.close().await.expect("second close is a no-op");
        assert_eq!(transport.negotiation_state(), NegotiationState::Closed);
        assert!(matches!(
            transport.create_offer().await,
            Err(TransportError::Closed)
        ));
    }
}
