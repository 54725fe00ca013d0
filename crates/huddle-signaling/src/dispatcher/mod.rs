//! The signaling manager: routes inbound signals, drives each connection's
//! negotiation and owns the registry, candidate buffer and in-flight sets.
//!
//! All bookkeeping sits behind one lock that is never held across an await.
//! Transport calls and bus sends are the only suspension points; every
//! handler re-checks its [`Ticket`] after resuming, because a close or a
//! replacement may have happened in between.

mod answer;
mod candidate;
mod offer;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use signal_bus::{Envelope, SignalBus};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::candidates::CandidateBuffer;
use crate::config::SignalingConfig;
use crate::error::{RegistryError, SignalingError};
use crate::ice::{IceServerResolver, StaticIceServers};
use crate::ids::{ConnectionId, Direction, PeerId, Role, StreamKind};
use crate::media::{LocalMediaSource, NoLocalMedia, NullObserver, StreamObserver};
use crate::message::{CandidateSignal, MediaStateSignal, SignalMessage};
use crate::reaper;
use crate::registry::{
    Admitted, Announcement, ConnectionRecord, Draft, Link, Registry, Teardown, Ticket,
};
use crate::state::{ConnectionState, Transition};
use crate::transport::{
    LinkState, PeerTransport, PeerTransportFactory, RoutedEvent, TransportError, TransportEvent,
    TransportEvents,
};

/// Result of a signaling operation that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Ignored(Ignored),
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied)
    }
}

/// Why a signal or call was dropped without touching any connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ignored {
    SelfAddressed,
    /// The same negotiation step is already running for this id.
    InFlight,
    /// A live record already holds the id.
    Active(ConnectionState),
    NoRecord,
    UnexpectedState(ConnectionState),
    /// The transport is not waiting for an answer.
    NotAwaitingAnswer,
    NoLocalMedia,
    /// The record was closed or replaced while this call was suspended.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied(ConnectionId),
    Buffered(ConnectionId),
    /// The transport refused the candidate; the connection is left as is.
    Rejected(ConnectionId),
}

/// Read-only view of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub id: ConnectionId,
    pub remote: PeerId,
    pub remote_name: Option<String>,
    pub kind: StreamKind,
    pub direction: Direction,
    pub role: Role,
    pub state: ConnectionState,
    pub generation: u64,
    pub transitions: u32,
    pub placeholder: bool,
    pub remote_applied: bool,
    pub pending_candidates: usize,
    pub age: Duration,
    pub idle_for: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Lane {
    Offer,
    Answer,
}

struct Shared {
    registry: Registry,
    candidates: CandidateBuffer,
    offers_in_flight: HashMap<ConnectionId, u64>,
    answers_in_flight: HashMap<ConnectionId, u64>,
}

impl Shared {
    fn lane(&mut self, lane: Lane) -> &mut HashMap<ConnectionId, u64> {
        match lane {
            Lane::Offer => &mut self.offers_in_flight,
            Lane::Answer => &mut self.answers_in_flight,
        }
    }

    /// Registers a new record, turning an occupied id into the reason the
    /// caller should report.
    fn admit(
        &mut self,
        draft: Draft,
        initial: ConnectionState,
        link: Link,
        now: Instant,
    ) -> Result<Admitted, Ignored> {
        let id = draft.id.clone();
        match self.registry.put(draft, initial, link, now) {
            Ok(admitted) => {
                if let Some(evicted) = &admitted.evicted {
                    self.candidates.discard(&id);
                    self.release(&evicted.ticket());
                }
                Ok(admitted)
            }
            Err(RegistryError::Occupied { state, .. }) => Err(Ignored::Active(state)),
            Err(err) => {
                warn!(connection_id = %id, error = %err, "record admission refused");
                Err(Ignored::UnexpectedState(initial))
            }
        }
    }

    /// Closes the record under `id` and lets go of everything keyed to it.
    /// A negotiation still suspended for it finds its ticket stale.
    fn retire(&mut self, id: &ConnectionId, now: Instant) -> Option<ConnectionRecord> {
        let dropped = self.candidates.discard(id);
        if dropped > 0 {
            trace!(connection_id = %id, dropped, "discarded buffered candidates");
        }
        let record = self.registry.close(id, now)?;
        self.release(&record.ticket());
        Some(record)
    }

    /// Frees the in-flight slots held by this generation. Newer generations
    /// keep theirs.
    fn release(&mut self, ticket: &Ticket) {
        for lane in [Lane::Offer, Lane::Answer] {
            let set = self.lane(lane);
            if set.get(ticket.id()) == Some(&ticket.generation()) {
                set.remove(ticket.id());
            }
        }
    }
}

/// Holds an id in an in-flight set until dropped, whichever way the
/// negotiation ends.
struct InFlight<'a> {
    inner: &'a Inner,
    lane: Lane,
    ticket: Ticket,
}

impl<'a> InFlight<'a> {
    fn new(inner: &'a Inner, lane: Lane, ticket: Ticket) -> Self {
        Self {
            inner,
            lane,
            ticket,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut shared = self.inner.shared.lock();
        let set = shared.lane(self.lane);
        if set.get(self.ticket.id()) == Some(&self.ticket.generation()) {
            set.remove(self.ticket.id());
        }
    }
}

pub(crate) struct Inner {
    local: PeerId,
    display_name: Option<String>,
    config: SignalingConfig,
    bus: Arc<dyn SignalBus>,
    factory: Arc<dyn PeerTransportFactory>,
    ice: Arc<dyn IceServerResolver>,
    media: Arc<dyn LocalMediaSource>,
    observer: Arc<dyn StreamObserver>,
    shared: Mutex<Shared>,
    events_tx: mpsc::UnboundedSender<RoutedEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<RoutedEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

pub struct SignalingManagerBuilder {
    local: PeerId,
    display_name: Option<String>,
    bus: Arc<dyn SignalBus>,
    factory: Arc<dyn PeerTransportFactory>,
    ice: Arc<dyn IceServerResolver>,
    media: Arc<dyn LocalMediaSource>,
    observer: Arc<dyn StreamObserver>,
    config: SignalingConfig,
}

impl SignalingManagerBuilder {
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn config(mut self, config: SignalingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn ice_servers(mut self, resolver: Arc<dyn IceServerResolver>) -> Self {
        self.ice = resolver;
        self
    }

    pub fn local_media(mut self, media: Arc<dyn LocalMediaSource>) -> Self {
        self.media = media;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> SignalingManager {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            registry: Registry::new(self.local.clone()),
            candidates: CandidateBuffer::new(self.config.candidate_queue_limit),
            offers_in_flight: HashMap::new(),
            answers_in_flight: HashMap::new(),
        };
        SignalingManager {
            inner: Arc::new(Inner {
                local: self.local,
                display_name: self.display_name,
                config: self.config,
                bus: self.bus,
                factory: self.factory,
                ice: self.ice,
                media: self.media,
                observer: self.observer,
                shared: Mutex::new(shared),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

#[derive(Clone)]
pub struct SignalingManager {
    inner: Arc<Inner>,
}

fn negotiation_error(id: &ConnectionId) -> impl Fn(TransportError) -> SignalingError + '_ {
    move |source| SignalingError::Negotiation {
        id: id.clone(),
        source,
    }
}

impl SignalingManager {
    pub fn builder(
        local: impl Into<PeerId>,
        bus: Arc<dyn SignalBus>,
        factory: Arc<dyn PeerTransportFactory>,
    ) -> SignalingManagerBuilder {
        SignalingManagerBuilder {
            local: local.into(),
            display_name: None,
            bus,
            factory,
            ice: Arc::new(StaticIceServers::default()),
            media: Arc::new(NoLocalMedia),
            observer: Arc::new(NullObserver),
            config: SignalingConfig::default(),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock()
    }

    /// Starts the inbound listener, the transport event pump and the reaper.
    /// Calling it again is a no-op.
    pub fn spawn_background(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let inbox = self.inner.bus.subscribe(self.inner.local.as_str());
        tasks.push(spawn_listener(weak.clone(), inbox));
        if let Some(events) = self.inner.events_rx.lock().take() {
            tasks.push(spawn_event_pump(weak.clone(), events));
        }
        tasks.push(reaper::spawn(weak, self.inner.config.reap_interval));
        debug!(peer = %self.inner.local, "signaling background tasks started");
    }

    /// Stops background work and closes every connection.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        let closed = self.close_all_connections().await;
        info!(peer = %self.inner.local, closed, "signaling manager shut down");
    }

    /// Decodes one bus envelope and dispatches it. Undecodable or spoofed
    /// envelopes are logged and dropped.
    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<(), SignalingError> {
        let message = match SignalMessage::decode(&envelope.payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(from = %envelope.from, error = %err, "dropping undecodable signal");
                return Ok(());
            }
        };
        if message.sender().as_str() != envelope.from {
            warn!(
                from = %envelope.from,
                claimed = %message.sender(),
                signal = message.label(),
                "dropping signal with mismatched sender"
            );
            return Ok(());
        }
        self.handle_message(message).await
    }

    pub async fn handle_message(&self, message: SignalMessage) -> Result<(), SignalingError> {
        if message.sender() == &self.inner.local {
            trace!(signal = message.label(), "ignoring own signal");
            return Ok(());
        }
        let label = message.label();
        let from = message.sender().clone();
        let outcome = match message {
            SignalMessage::Offer(offer) => {
                let media = self.inner.media.tracks_for(offer.kind);
                self.handle_offer(offer, media).await?
            }
            SignalMessage::Answer(answer) => self.handle_answer(answer).await?,
            SignalMessage::IceCandidate(signal) => {
                let outcome = self.handle_ice_candidate(signal).await?;
                trace!(from = %from, ?outcome, "remote candidate handled");
                return Ok(());
            }
            SignalMessage::RequestStream(request) => self.handle_request_stream(request).await?,
            SignalMessage::MediaState(state) => {
                self.handle_media_state(state).await?;
                return Ok(());
            }
        };
        if let Outcome::Ignored(reason) = outcome {
            debug!(from = %from, signal = label, ?reason, "signal ignored");
        }
        Ok(())
    }

    /// Reacts to a participant announcing which media it publishes.
    pub async fn handle_media_state(&self, state: MediaStateSignal) -> Result<(), SignalingError> {
        let mut first_error = None;
        for kind in StreamKind::ALL {
            match state.flag_for(kind) {
                Some(false) => {
                    let id = ConnectionId::incoming(&self.inner.local, &state.from_id, kind);
                    if self.close_connection(&id).await {
                        debug!(connection_id = %id, "remote stopped publishing");
                    }
                }
                Some(true) => {
                    if let Err(err) = self.request_stream(&state.from_id, kind).await {
                        warn!(peer = %state.from_id, kind = %kind, error = %err, "stream request failed");
                        first_error.get_or_insert(err);
                    }
                }
                None => {}
            }
        }
        if let Some(microphone) = state.microphone {
            trace!(peer = %state.from_id, microphone, "microphone rides the camera feed");
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn handle_transport_event(&self, routed: RoutedEvent) {
        let RoutedEvent {
            id,
            generation,
            event,
        } = routed;
        let ticket = Ticket::new(id, generation);
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let remote = {
                    let shared = self.lock();
                    match shared.registry.current(&ticket) {
                        Some(record) if !record.state().is_terminal() => record.remote().clone(),
                        _ => {
                            trace!(connection_id = %ticket.id(), "local candidate for retired record");
                            return;
                        }
                    }
                };
                let message = SignalMessage::IceCandidate(CandidateSignal {
                    from_id: self.inner.local.clone(),
                    kind: ticket.id().kind(),
                    candidate,
                });
                if let Err(err) = self.send(&remote, message).await {
                    warn!(connection_id = %ticket.id(), error = %err, "failed to send local candidate");
                }
            }
            TransportEvent::StateChanged(state) => self.on_link_state(&ticket, state),
            TransportEvent::RemoteMedia(media) => {
                let announcement = {
                    let mut shared = self.lock();
                    if !shared.registry.add_remote_media(&ticket, media) {
                        return;
                    }
                    shared.registry.take_announcement(&ticket)
                };
                if let Some(announcement) = announcement {
                    self.announce(announcement);
                }
            }
        }
    }

    fn on_link_state(&self, ticket: &Ticket, state: LinkState) {
        match state {
            LinkState::Connected => {
                let announcement = {
                    let mut shared = self.lock();
                    match shared
                        .registry
                        .transition(ticket, ConnectionState::Connected, Instant::now())
                    {
                        Ok(Transition::Applied { .. }) => {
                            info!(connection_id = %ticket.id(), "connection established");
                            shared.registry.take_announcement(ticket)
                        }
                        Ok(Transition::Unchanged(_)) => None,
                        Ok(Transition::Rejected { from, .. }) => {
                            debug!(connection_id = %ticket.id(), from = %from, "connected report ignored");
                            None
                        }
                        Err(_) => None,
                    }
                };
                if let Some(announcement) = announcement {
                    self.announce(announcement);
                }
            }
            LinkState::Failed | LinkState::Closed => {
                self.mark_failed(ticket, &format!("transport reported {state:?}"));
            }
            LinkState::New | LinkState::Connecting | LinkState::Disconnected => {
                trace!(connection_id = %ticket.id(), ?state, "link state");
                self.lock().registry.touch(ticket.id(), Instant::now());
            }
        }
    }

    fn announce(&self, announcement: Announcement) {
        info!(peer = %announcement.remote, kind = %announcement.kind, "remote stream received");
        self.inner
            .observer
            .on_stream_received(&announcement.remote, announcement.media, announcement.kind);
    }

    /// Closes one connection. Returns false if there was nothing to close.
    /// A negotiation still running for it is abandoned and the id is free
    /// for a new attempt straight away.
    pub async fn close_connection(&self, id: &ConnectionId) -> bool {
        let record = self.lock().retire(id, Instant::now());
        match record {
            Some(record) => {
                self.teardown(record.into_teardown()).await;
                true
            }
            None => false,
        }
    }

    /// Closes every connection toward `remote`, e.g. when they leave the chat.
    pub async fn close_peer(&self, remote: &PeerId) -> usize {
        let records = {
            let now = Instant::now();
            let mut shared = self.lock();
            for kind in StreamKind::ALL {
                shared
                    .candidates
                    .discard(&ConnectionId::incoming(&self.inner.local, remote, kind));
                shared
                    .candidates
                    .discard(&ConnectionId::outgoing(&self.inner.local, remote, kind));
            }
            let ids = shared.registry.ids_for_peer(remote);
            ids.iter()
                .filter_map(|id| shared.retire(id, now))
                .collect::<Vec<_>>()
        };
        let closed = records.len();
        for record in records {
            self.teardown(record.into_teardown()).await;
        }
        closed
    }

    pub async fn close_all_connections(&self) -> usize {
        let records = {
            let mut shared = self.lock();
            shared.candidates.clear();
            shared.offers_in_flight.clear();
            shared.answers_in_flight.clear();
            shared.registry.close_all(Instant::now())
        };
        let closed = records.len();
        for record in records {
            self.teardown(record.into_teardown()).await;
        }
        closed
    }

    /// One reaper pass: removes failed records and negotiations that stopped
    /// making progress, then candidate queues nobody claimed in time.
    /// Returns the ids of the records it closed.
    pub async fn reap_stale(&self) -> Vec<ConnectionId> {
        let now = Instant::now();
        let stale_after = self.inner.config.stale_after;
        let reaped = {
            let mut shared = self.lock();
            let ids = reaper::sweep(&shared.registry, now, stale_after);
            let mut reaped = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(state) = shared.registry.get(&id).map(ConnectionRecord::state) {
                    info!(connection_id = %id, %state, "reaping stale connection");
                }
                if let Some(record) = shared.retire(&id, now) {
                    reaped.push(record);
                }
            }
            let Shared {
                registry,
                candidates,
                ..
            } = &mut *shared;
            let orphans = candidates.expire(now, stale_after, |id| registry.get(id).is_none());
            for (id, dropped) in orphans {
                debug!(connection_id = %id, dropped, "expired unclaimed candidates");
            }
            reaped
        };
        let mut ids = Vec::with_capacity(reaped.len());
        for record in reaped {
            ids.push(record.id().clone());
            self.teardown(record.into_teardown()).await;
        }
        ids
    }

    pub fn snapshot(&self) -> Vec<RecordSnapshot> {
        let now = Instant::now();
        let shared = self.lock();
        let mut records: Vec<RecordSnapshot> = shared
            .registry
            .iter()
            .map(|record| RecordSnapshot {
                id: record.id().clone(),
                remote: record.remote().clone(),
                remote_name: record.remote_name().map(str::to_string),
                kind: record.kind(),
                direction: record.direction(),
                role: record.role(),
                state: record.state(),
                generation: record.generation(),
                transitions: record.transitions(),
                placeholder: record.is_placeholder(),
                remote_applied: record.remote_applied(),
                pending_candidates: shared.candidates.pending(record.id()),
                age: now.saturating_duration_since(record.created_at()),
                idle_for: now.saturating_duration_since(record.last_activity()),
            })
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn state_of(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.lock().registry.get(id).map(|record| record.state())
    }

    pub fn pending_candidates(&self, id: &ConnectionId) -> usize {
        self.lock().candidates.pending(id)
    }

    /// Connected records with the given role, optionally of one kind.
    pub fn list_by_role_and_kind(&self, role: Role, kind: Option<StreamKind>) -> Vec<RecordSnapshot> {
        let ids: Vec<ConnectionId> = self
            .lock()
            .registry
            .list_by_role_and_kind(role, kind)
            .into_iter()
            .map(|record| record.id().clone())
            .collect();
        self.snapshot()
            .into_iter()
            .filter(|record| ids.contains(&record.id))
            .collect()
    }

    async fn send(&self, to: &PeerId, message: SignalMessage) -> Result<(), SignalingError> {
        let payload = message.encode()?;
        trace!(to = %to, signal = message.label(), "sending signal");
        self.inner
            .bus
            .publish(Envelope::to_peer(
                self.inner.local.as_str(),
                to.as_str(),
                payload,
            ))
            .await?;
        Ok(())
    }

    /// Builds the transport for `ticket`. `None` means the record was closed
    /// or replaced meanwhile; the new transport has already been closed.
    async fn build_transport(
        &self,
        ticket: &Ticket,
    ) -> Result<Option<Arc<dyn PeerTransport>>, SignalingError> {
        let servers = self.inner.ice.resolve();
        let events = TransportEvents::new(
            ticket.id().clone(),
            ticket.generation(),
            self.inner.events_tx.clone(),
        );
        let transport = self
            .inner
            .factory
            .create(servers, events)
            .await
            .map_err(negotiation_error(ticket.id()))?;
        let attached = self.lock().registry.attach(ticket, Arc::clone(&transport));
        if attached {
            return Ok(Some(transport));
        }
        debug!(connection_id = %ticket.id(), "record retired while its transport was built");
        if let Err(err) = transport.close().await {
            warn!(connection_id = %ticket.id(), error = %err, "failed to close orphaned transport");
        }
        Ok(None)
    }

    fn advance(&self, ticket: &Ticket, to: ConnectionState) -> bool {
        let mut shared = self.lock();
        match shared.registry.transition(ticket, to, Instant::now()) {
            Ok(transition) if transition.succeeded() => true,
            Ok(transition) => {
                debug!(connection_id = %ticket.id(), ?transition, "negotiation step rejected");
                false
            }
            Err(_) => false,
        }
    }

    fn is_current(&self, ticket: &Ticket) -> bool {
        self.lock()
            .registry
            .current(ticket)
            .is_some_and(|record| !record.state().is_terminal())
    }

    /// Resolves a negotiation error. If the record was closed or replaced
    /// while the step was suspended, the error belongs to a retired
    /// transport and the call reports itself superseded.
    fn settle_failure(
        &self,
        ticket: &Ticket,
        err: SignalingError,
    ) -> Result<Outcome, SignalingError> {
        if self.lock().registry.current(ticket).is_none() {
            debug!(connection_id = %ticket.id(), error = %err, "negotiation abandoned, record retired");
            return Ok(Outcome::Ignored(Ignored::Superseded));
        }
        self.mark_failed(ticket, &err.to_string());
        Err(err)
    }

    fn mark_failed(&self, ticket: &Ticket, reason: &str) {
        let notice = {
            let mut shared = self.lock();
            match shared
                .registry
                .transition(ticket, ConnectionState::Failed, Instant::now())
            {
                Ok(Transition::Applied { .. }) => shared.registry.take_removal_notice(ticket),
                _ => return,
            }
        };
        warn!(connection_id = %ticket.id(), reason = %reason, "connection failed");
        if let Some((peer, kind)) = notice {
            self.inner.observer.on_stream_removed(&peer, kind);
        }
    }

    /// Applies candidates that queued up while the remote description was
    /// pending, then opens the record for direct application. Loops so that
    /// candidates arriving mid-drain keep their order.
    async fn drain_candidates(&self, ticket: &Ticket, transport: &Arc<dyn PeerTransport>) {
        loop {
            let batch = {
                let mut shared = self.lock();
                if shared.registry.current(ticket).is_none() {
                    let dropped = shared.candidates.discard(ticket.id());
                    if dropped > 0 {
                        debug!(connection_id = %ticket.id(), dropped, "dropping candidates for closed connection");
                    }
                    return;
                }
                let batch = shared.candidates.drain(ticket.id());
                if batch.is_empty() {
                    shared.registry.mark_remote_applied(ticket);
                    return;
                }
                batch
            };
            trace!(connection_id = %ticket.id(), count = batch.len(), "applying buffered candidates");
            for candidate in batch {
                if let Err(err) = transport.add_ice_candidate(candidate).await {
                    warn!(connection_id = %ticket.id(), error = %err, "buffered candidate rejected");
                }
            }
        }
    }

    async fn teardown(&self, teardown: Teardown) {
        if let Some(transport) = &teardown.transport {
            if let Err(err) = transport.close().await {
                warn!(connection_id = %teardown.id, error = %err, "transport close failed");
            }
        }
        if teardown.notify_removed {
            self.inner
                .observer
                .on_stream_removed(&teardown.remote, teardown.kind);
        }
        debug!(
            connection_id = %teardown.id,
            transitions = teardown.transitions,
            direction = ?teardown.direction,
            "connection removed"
        );
    }
}

fn spawn_listener(inner: Weak<Inner>, mut inbox: broadcast::Receiver<Envelope>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let envelope = match inbox.recv().await {
                Ok(envelope) => envelope,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "signal listener lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let manager = SignalingManager::from_inner(inner);
            if let Err(err) = manager.handle_envelope(envelope).await {
                warn!(error = %err, "signal handling failed");
            }
        }
    })
}

fn spawn_event_pump(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<RoutedEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(routed) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            SignalingManager::from_inner(inner)
                .handle_transport_event(routed)
                .await;
        }
    })
}
