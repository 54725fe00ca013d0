#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use huddle_signaling::{
    ConnectionId, IceCandidate, IceServer, MediaHandle, NegotiationState, PeerId, PeerTransport,
    PeerTransportFactory, PublishedMedia, RemoteMedia, RoutedEvent, SdpKind, SessionDescription,
    SignalMessage, SignalingManager, StreamKind, StreamObserver, TransportError, TransportEvent,
    TransportEvents,
};
use parking_lot::Mutex;
use signal_bus::{Envelope, LocalSignalBus, SignalBus};
use tokio::sync::broadcast;

#[derive(Default)]
struct FactoryState {
    built: Vec<Arc<FakeTransport>>,
    fail_next: bool,
    ice_servers: Vec<Vec<IceServer>>,
}

/// Hands out [`FakeTransport`]s and remembers every one it built.
#[derive(Default)]
pub struct FakeFactory {
    state: Mutex<FactoryState>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_create(&self) {
        self.state.lock().fail_next = true;
    }

    pub fn built(&self) -> Vec<Arc<FakeTransport>> {
        self.state.lock().built.clone()
    }

    pub fn build_count(&self) -> usize {
        self.state.lock().built.len()
    }

    pub fn last(&self) -> Arc<FakeTransport> {
        self.state
            .lock()
            .built
            .last()
            .cloned()
            .expect("no transport built yet")
    }

    pub fn for_id(&self, id: &ConnectionId) -> Vec<Arc<FakeTransport>> {
        self.state
            .lock()
            .built
            .iter()
            .filter(|transport| transport.id() == id)
            .cloned()
            .collect()
    }

    pub fn ice_servers_seen(&self) -> Vec<Vec<IceServer>> {
        self.state.lock().ice_servers.clone()
    }
}

#[async_trait]
impl PeerTransportFactory for FakeFactory {
    async fn create(
        &self,
        ice_servers: Vec<IceServer>,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.ice_servers.push(ice_servers);
        if std::mem::take(&mut state.fail_next) {
            return Err(TransportError::Setup("refused by test".into()));
        }
        let transport = Arc::new(FakeTransport::new(events));
        state.built.push(Arc::clone(&transport));
        Ok(transport)
    }
}

#[derive(Debug)]
struct Negotiation {
    signaling: NegotiationState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    media: Vec<StreamKind>,
    closes: usize,
}

/// In-memory stand-in for a peer connection. It enforces the offer/answer
/// order a real one does and refuses candidates before a remote description.
pub struct FakeTransport {
    events: TransportEvents,
    state: Mutex<Negotiation>,
}

impl FakeTransport {
    fn new(events: TransportEvents) -> Self {
        Self {
            events,
            state: Mutex::new(Negotiation {
                signaling: NegotiationState::Stable,
                local: None,
                remote: None,
                candidates: Vec::new(),
                media: Vec::new(),
                closes: 0,
            }),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        self.events.connection_id()
    }

    pub fn route(&self, event: TransportEvent) -> RoutedEvent {
        self.events.route(event)
    }

    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.emit(event)
    }

    pub fn candidates(&self) -> Vec<String> {
        self.state
            .lock()
            .candidates
            .iter()
            .map(|candidate| candidate.candidate.clone())
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    pub fn attached_media(&self) -> Vec<StreamKind> {
        self.state.lock().media.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    fn check_open(state: &Negotiation) -> Result<(), TransportError> {
        if state.signaling == NegotiationState::Closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn attach_media(&self, media: &MediaHandle) -> Result<(), TransportError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.media.push(media.kind());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        tokio::task::yield_now().await;
        let state = self.state.lock();
        Self::check_open(&state)?;
        Ok(SessionDescription::offer(format!("offer for {}", self.id())))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        tokio::task::yield_now().await;
        let state = self.state.lock();
        Self::check_open(&state)?;
        if state.signaling != NegotiationState::HaveRemoteOffer {
            return Err(TransportError::Negotiation("no remote offer".into()));
        }
        Ok(SessionDescription::answer(format!("answer for {}", self.id())))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.signaling = match (desc.kind, state.signaling) {
            (SdpKind::Offer, NegotiationState::Stable) => NegotiationState::HaveLocalOffer,
            (SdpKind::Answer, NegotiationState::HaveRemoteOffer) => NegotiationState::Stable,
            (kind, current) => {
                return Err(TransportError::Negotiation(format!(
                    "local {kind:?} in {current:?}"
                )));
            }
        };
        state.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.signaling = match (desc.kind, state.signaling) {
            (SdpKind::Offer, NegotiationState::Stable) => NegotiationState::HaveRemoteOffer,
            (SdpKind::Answer, NegotiationState::HaveLocalOffer) => NegotiationState::Stable,
            (kind, current) => {
                return Err(TransportError::Negotiation(format!(
                    "remote {kind:?} in {current:?}"
                )));
            }
        };
        state.remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.remote.is_none() {
            return Err(TransportError::Negotiation(
                "candidate before remote description".into(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn negotiation_state(&self) -> NegotiationState {
        self.state.lock().signaling
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.closes += 1;
        state.signaling = NegotiationState::Closed;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Received(PeerId, StreamKind),
    Removed(PeerId, StreamKind),
}

#[derive(Default)]
pub struct RecordingObserver {
    seen: Mutex<Vec<Observed>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self) -> Vec<Observed> {
        self.seen.lock().clone()
    }
}

impl StreamObserver for RecordingObserver {
    fn on_stream_received(&self, peer: &PeerId, _media: RemoteMedia, kind: StreamKind) {
        self.seen.lock().push(Observed::Received(peer.clone(), kind));
    }

    fn on_stream_removed(&self, peer: &PeerId, kind: StreamKind) {
        self.seen.lock().push(Observed::Removed(peer.clone(), kind));
    }
}

/// One participant wired to a shared bus with fakes everywhere.
pub struct Participant {
    pub manager: SignalingManager,
    pub factory: Arc<FakeFactory>,
    pub observer: Arc<RecordingObserver>,
    pub media: Arc<PublishedMedia>,
    pub inbox: broadcast::Receiver<Envelope>,
}

impl Participant {
    pub fn join(bus: &Arc<LocalSignalBus>, id: &str) -> Self {
        let factory = FakeFactory::new();
        let observer = RecordingObserver::new();
        let media = Arc::new(PublishedMedia::new());
        let inbox = bus.subscribe(id);
        let manager = SignalingManager::builder(id, bus.clone(), factory.clone())
            .display_name(format!("{id} (test)"))
            .local_media(media.clone())
            .observer(observer.clone())
            .build();
        Self {
            manager,
            factory,
            observer,
            media,
            inbox,
        }
    }

    pub fn publish(&self, kind: StreamKind) -> MediaHandle {
        let handle = MediaHandle::new(kind, Vec::new());
        self.media.publish(handle.clone());
        handle
    }

    pub fn peer(&self) -> PeerId {
        self.manager.local_id().clone()
    }

    /// Decodes everything waiting in the inbox without handling it.
    pub fn take_inbox(&mut self) -> Vec<SignalMessage> {
        let mut messages = Vec::new();
        while let Ok(envelope) = self.inbox.try_recv() {
            messages.push(SignalMessage::decode(&envelope.payload).expect("valid signal"));
        }
        messages
    }

    /// Handles everything waiting in the inbox, in order. Returns how many
    /// envelopes were processed.
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(envelope) = self.inbox.try_recv() {
            self.manager
                .handle_envelope(envelope)
                .await
                .expect("signal handled");
            handled += 1;
        }
        handled
    }
}

pub fn camera_id(origin: &Participant, target: &Participant) -> ConnectionId {
    ConnectionId::new(origin.peer(), target.peer(), StreamKind::Camera)
}

pub fn candidate(text: &str) -> IceCandidate {
    IceCandidate {
        candidate: text.to_string(),
        sdp_mid: Some("0".into()),
        sdp_m_line_index: Some(0),
        username_fragment: None,
    }
}
