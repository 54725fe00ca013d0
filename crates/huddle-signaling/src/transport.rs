//! Contract of the underlying negotiated transport (one peer connection per
//! record) and the event path back into the manager.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::ice::IceServer;
use crate::ids::ConnectionId;
use crate::media::{MediaHandle, RemoteMedia};
use crate::message::{IceCandidate, SessionDescription};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation step failed: {0}")]
    Negotiation(String),
    #[error("media attach failed: {0}")]
    Media(String),
    #[error("transport closed")]
    Closed,
}

/// Offer/answer progress as reported by the transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    StateChanged(LinkState),
    RemoteMedia(RemoteMedia),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn attach_media(&self, media: &MediaHandle) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    fn negotiation_state(&self) -> NegotiationState;

    /// Must be safe to call more than once.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: Vec<IceServer>,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

/// An event tagged with the record generation that produced it.
#[derive(Debug, Clone)]
pub struct RoutedEvent {
    pub id: ConnectionId,
    pub generation: u64,
    pub event: TransportEvent,
}

/// Sink handed to a transport at construction; events from a record that has
/// since been replaced are dropped by the manager.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    id: ConnectionId,
    generation: u64,
    tx: mpsc::UnboundedSender<RoutedEvent>,
}

impl TransportEvents {
    pub(crate) fn new(
        id: ConnectionId,
        generation: u64,
        tx: mpsc::UnboundedSender<RoutedEvent>,
    ) -> Self {
        Self { id, generation, tx }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn route(&self, event: TransportEvent) -> RoutedEvent {
        RoutedEvent {
            id: self.id.clone(),
            generation: self.generation,
            event,
        }
    }

    /// Returns false once the manager is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send(self.route(event)).is_ok()
    }
}
