//! Peer-to-peer media signaling for a chat room.
//!
//! Every media flow between two participants is its own directional
//! connection, keyed by `{origin}->{target}/{kind}`. A [`SignalingManager`]
//! owns the records for the local participant, negotiates them over a
//! [`signal_bus::SignalBus`] and hands remote streams to a
//! [`StreamObserver`].

pub mod candidates;
pub mod config;
mod dispatcher;
pub mod engine;
pub mod error;
pub mod ice;
pub mod ids;
pub mod media;
pub mod message;
pub mod reaper;
pub mod registry;
pub mod state;
pub mod transport;

pub use candidates::CandidateBuffer;
pub use config::SignalingConfig;
pub use dispatcher::{
    CandidateOutcome, Ignored, Outcome, RecordSnapshot, SignalingManager, SignalingManagerBuilder,
};
pub use engine::WebRtcTransportFactory;
pub use error::{ConfigError, RegistryError, SignalingError};
pub use ice::{IceConfig, IceServer, IceServerResolver, StaticIceServers};
pub use ids::{ConnectionId, Direction, PeerId, Role, StreamKind};
pub use media::{
    LocalMediaSource, LocalTrack, MediaHandle, NoLocalMedia, NullObserver, PublishedMedia,
    RemoteMedia, StreamObserver,
};
pub use message::{
    AnswerSignal, CandidateSignal, IceCandidate, MediaStateSignal, OfferSignal, SdpKind,
    SessionDescription, SignalMessage, StreamRequest,
};
pub use state::{ConnectionState, Transition};
pub use transport::{
    LinkState, NegotiationState, PeerTransport, PeerTransportFactory, RoutedEvent, TransportError,
    TransportEvent, TransportEvents,
};
