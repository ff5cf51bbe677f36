use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use super::CallError;
use super::envelope::{IceCandidate, SessionDescription, UserId};
use super::media::{LocalStream, MediaTrack, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }
}

/// Native peer-connection primitives the negotiation engine drives.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;
    /// Swaps the outgoing track of `kind` without renegotiating.
    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), CallError>;
    async fn close(&self) -> Result<(), CallError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Builds a transport for one remote user, seeded with the tracks of
    /// `local`. Callbacks report through `events`.
    async fn create(
        &self,
        events: TransportEvents,
        local: &LocalStream,
    ) -> Result<Arc<dyn PeerTransport>, CallError>;
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    IceCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteTrack(RemoteTrack),
}

#[derive(Debug, Clone)]
pub(crate) struct PeerEvent {
    pub remote: UserId,
    pub generation: u64,
    pub event: TransportEvent,
}

/// Event sink handed to a transport at creation. Every event is stamped with
/// the peer and generation it came from.
#[derive(Clone)]
pub struct TransportEvents {
    remote: UserId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl TransportEvents {
    pub(crate) fn new(remote: UserId, generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            remote,
            generation,
            tx,
        }
    }

    pub fn remote(&self) -> UserId {
        self.remote
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the session stopped listening.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(PeerEvent {
                remote: self.remote,
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEvents")
            .field("remote", &self.remote)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
    /// The live RTP track when the transport is backed by webrtc-rs.
    pub rtc: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id: stream_id.into(),
            rtc: None,
        }
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("rtc", &self.rtc.is_some())
            .finish()
    }
}

/// Media received from one remote participant. Shared with the UI by `Arc`.
#[derive(Debug)]
pub struct RemoteStream {
    user: UserId,
    tracks: RwLock<Vec<RemoteTrack>>,
}

impl RemoteStream {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            tracks: RwLock::new(Vec::new()),
        }
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.read().clone()
    }

    pub fn track(&self, kind: TrackKind) -> Option<RemoteTrack> {
        self.tracks
            .read()
            .iter()
            .find(|track| track.kind == kind)
            .cloned()
    }

    /// Adds `track` unless one with the same id is already present.
    pub(crate) fn add_track(&self, track: RemoteTrack) -> bool {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|existing| existing.id == track.id) {
            return false;
        }
        tracks.push(track);
        true
    }
}
