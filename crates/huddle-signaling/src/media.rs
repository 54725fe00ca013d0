//! Local capture and remote stream hand-off. Capture itself lives outside this
//! crate; the manager only needs tracks per stream kind.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::ids::{PeerId, StreamKind};

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

#[derive(Clone)]
pub struct MediaHandle {
    kind: StreamKind,
    tracks: Vec<LocalTrack>,
}

impl MediaHandle {
    pub fn new(kind: StreamKind, tracks: Vec<LocalTrack>) -> Self {
        Self { kind, tracks }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle")
            .field("kind", &self.kind)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct RemoteMedia {
    tracks: Vec<Arc<TrackRemote>>,
}

impl RemoteMedia {
    pub fn new(tracks: Vec<Arc<TrackRemote>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<TrackRemote>] {
        &self.tracks
    }

    pub(crate) fn merge(&mut self, other: RemoteMedia) {
        self.tracks.extend(other.tracks);
    }
}

impl fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

pub trait LocalMediaSource: Send + Sync {
    /// Tracks currently being published for `kind`, if capture is running.
    fn tracks_for(&self, kind: StreamKind) -> Option<MediaHandle>;
}

/// Listener-only participant.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLocalMedia;

impl LocalMediaSource for NoLocalMedia {
    fn tracks_for(&self, _kind: StreamKind) -> Option<MediaHandle> {
        None
    }
}

/// Media source fed by whatever toggles capture on and off.
#[derive(Default)]
pub struct PublishedMedia {
    handles: RwLock<HashMap<StreamKind, MediaHandle>>,
}

impl PublishedMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, handle: MediaHandle) {
        self.handles.write().insert(handle.kind(), handle);
    }

    pub fn withdraw(&self, kind: StreamKind) -> Option<MediaHandle> {
        self.handles.write().remove(&kind)
    }
}

impl LocalMediaSource for PublishedMedia {
    fn tracks_for(&self, kind: StreamKind) -> Option<MediaHandle> {
        self.handles.read().get(&kind).cloned()
    }
}

/// Notified when a remote participant's stream becomes playable or goes away.
pub trait StreamObserver: Send + Sync {
    fn on_stream_received(&self, peer: &PeerId, media: RemoteMedia, kind: StreamKind);

    fn on_stream_removed(&self, peer: &PeerId, kind: StreamKind);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl StreamObserver for NullObserver {
    fn on_stream_received(&self, _peer: &PeerId, _media: RemoteMedia, _kind: StreamKind) {}

    fn on_stream_removed(&self, _peer: &PeerId, _kind: StreamKind) {}
}
