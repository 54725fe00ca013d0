use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a chat participant as known to the signaling bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Category of media carried by one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamKind {
    Camera,
    Screen,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Camera, StreamKind::Screen];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Camera => "camera",
            StreamKind::Screen => "screen",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way media flows relative to the local participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Whether the local side sends media on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Sender,
    Receiver,
}

/// Key of a connection record.
///
/// The origin is the side whose media the connection was negotiated for (and
/// which sends the offer); the target receives it. `alice->bob/camera` and
/// `bob->alice/camera` are distinct, independently negotiated records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    origin: PeerId,
    target: PeerId,
    kind: StreamKind,
}

impl ConnectionId {
    pub fn new(origin: PeerId, target: PeerId, kind: StreamKind) -> Self {
        Self {
            origin,
            target,
            kind,
        }
    }

    /// Local media flowing to `remote`.
    pub fn outgoing(local: &PeerId, remote: &PeerId, kind: StreamKind) -> Self {
        Self::new(local.clone(), remote.clone(), kind)
    }

    /// `remote`'s media flowing to the local side.
    pub fn incoming(local: &PeerId, remote: &PeerId, kind: StreamKind) -> Self {
        Self::new(remote.clone(), local.clone(), kind)
    }

    pub fn origin(&self) -> &PeerId {
        &self.origin
    }

    pub fn target(&self) -> &PeerId {
        &self.target
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn direction_for(&self, local: &PeerId) -> Direction {
        if &self.origin == local {
            Direction::Outgoing
        } else {
            Direction::Incoming
        }
    }

    pub fn remote_for(&self, local: &PeerId) -> &PeerId {
        if &self.origin == local {
            &self.target
        } else {
            &self.origin
        }
    }

    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}/{}", self.origin, self.target, self.kind)
    }
}
