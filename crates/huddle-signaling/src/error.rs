use signal_bus::BusError;
use thiserror::Error;

use crate::ids::ConnectionId;
use crate::state::ConnectionState;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("negotiation failed for {id}: {source}")]
    Negotiation {
        id: ConnectionId,
        #[source]
        source: TransportError,
    },
    #[error("signaling bus error: {0}")]
    Bus(#[from] BusError),
    #[error("signal encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{id} already has a {state} record")]
    Occupied {
        id: ConnectionId,
        state: ConnectionState,
    },
    #[error("{id} has no placeholder to promote")]
    NoPlaceholder { id: ConnectionId },
    #[error("{id} cannot start in {state}")]
    IllegalStart {
        id: ConnectionId,
        state: ConnectionState,
    },
    #[error("{id} generation {generation} is no longer current")]
    Stale { id: ConnectionId, generation: u64 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid ice server url {url}: {reason}")]
    InvalidIceUrl { url: String, reason: String },
    #[error("turn urls configured without HUDDLE_TURN_USERNAME/HUDDLE_TURN_CREDENTIAL")]
    MissingTurnCredentials,
}
