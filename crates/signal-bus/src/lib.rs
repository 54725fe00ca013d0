//! Boundary to the chat channel that carries signaling between participants.
//!
//! The bus moves opaque payloads between peer identities. It makes no promise
//! beyond what the chat channel gives: ordered per sender, at-least-once, and
//! possibly dropped when nobody is listening.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    Peer(String),
    Everyone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub to: Recipient,
    pub payload: Bytes,
}

impl Envelope {
    pub fn to_peer(from: impl Into<String>, to: impl Into<String>, payload: Bytes) -> Self {
        Self {
            from: from.into(),
            to: Recipient::Peer(to.into()),
            payload,
        }
    }

    pub fn broadcast(from: impl Into<String>, payload: Bytes) -> Self {
        Self {
            from: from.into(),
            to: Recipient::Everyone,
            payload,
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no subscriber for peer {0}")]
    NoSubscriber(String),
}

pub type BusResult<T> = Result<T, BusError>;

#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Receive every envelope addressed to `peer`, directly or by broadcast.
    fn subscribe(&self, peer: &str) -> broadcast::Receiver<Envelope>;

    async fn publish(&self, envelope: Envelope) -> BusResult<()>;
}

/// In-process bus for tests and the loopback probe.
#[derive(Debug)]
pub struct LocalSignalBus {
    inboxes: parking_lot::RwLock<HashMap<String, broadcast::Sender<Envelope>>>,
    capacity: usize,
}

impl Default for LocalSignalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LocalSignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inboxes: parking_lot::RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.inboxes.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    fn inbox_for(&self, peer: &str) -> broadcast::Sender<Envelope> {
        if let Some(sender) = self.inboxes.read().get(peer) {
            return sender.clone();
        }
        let mut guard = self.inboxes.write();
        guard
            .entry(peer.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl SignalBus for LocalSignalBus {
    fn subscribe(&self, peer: &str) -> broadcast::Receiver<Envelope> {
        self.inbox_for(peer).subscribe()
    }

    async fn publish(&self, envelope: Envelope) -> BusResult<()> {
        match &envelope.to {
            Recipient::Peer(peer) => {
                let inbox = self.inbox_for(peer);
                inbox
                    .send(envelope.clone())
                    .map(|_| ())
                    .map_err(|_| BusError::NoSubscriber(peer.clone()))
            }
            Recipient::Everyone => {
                let targets: Vec<(String, broadcast::Sender<Envelope>)> = self
                    .inboxes
                    .read()
                    .iter()
                    .filter(|(peer, _)| **peer != envelope.from)
                    .map(|(peer, sender)| (peer.clone(), sender.clone()))
                    .collect();
                for (peer, sender) in targets {
                    if sender.send(envelope.clone()).is_err() {
                        tracing::trace!(peer = %peer, "broadcast skipped peer without subscriber");
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn direct_envelope_reaches_only_its_peer() {
        let bus = LocalSignalBus::new();
        let mut alice = bus.subscribe("alice");
        let mut bob = bus.subscribe("bob");
        bus.publish(Envelope::to_peer(
            "carol",
            "bob",
            Bytes::from_static(b"ping"),
        ))
        .await
        .expect("publish ok");
        let msg = bob.recv().await.expect("receive ok");
        assert_eq!(msg.from, "carol");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
        assert!(alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let bus = LocalSignalBus::new();
        let mut alice = bus.subscribe("alice");
        let mut bob = bus.subscribe("bob");
        bus.publish(Envelope::broadcast("alice", Bytes::from_static(b"hi")))
            .await
            .expect("publish ok");
        assert_eq!(bob.recv().await.expect("bob receives").from, "alice");
        assert!(alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn direct_envelope_without_listener_is_reported() {
        let bus = LocalSignalBus::new();
        let err = bus
            .publish(Envelope::to_peer("alice", "ghost", Bytes::new()))
            .await
            .expect_err("no subscriber");
        assert!(matches!(err, BusError::NoSubscriber(peer) if peer == "ghost"));
        assert_eq!(bus.peers(), vec!["ghost".to_string()]);
    }
}
