//! Group video-call core: signaling socket, per-peer negotiation and local
//! media, composed behind [`CallSession`].

use thiserror::Error;

pub mod envelope;
pub mod media;
pub mod mock;
pub mod negotiation;
pub mod network;
pub mod orchestrator;
pub mod registry;
pub mod rtc;
pub mod signaling;
pub mod subscription;
pub mod transport;

pub use envelope::{
    ClientMessage, IceCandidate, SdpKind, ServerMessage, SessionDescription, SignalPayload,
    UserId,
};
pub use media::{LocalMedia, LocalStream, MediaDevices, MediaTrack, ReadyState, TrackKind};
pub use network::NetworkStatus;
pub use orchestrator::CallSession;
pub use registry::{PeerRegistry, PeerState};
pub use signaling::{SignalSink, SignalingChannel};
pub use subscription::Subscription;
pub use transport::{
    PeerTransport, RemoteStream, RemoteTrack, TransportEvent, TransportFactory, TransportState,
};

#[derive(Debug, Error)]
pub enum CallError {
    #[error("unable to reach the call server: {0}")]
    SignalingUnavailable(String),
    #[error("camera/microphone access failed: {0}")]
    MediaAccess(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("peer transport error: {0}")]
    Transport(String),
    #[error("invalid call configuration: {0}")]
    InvalidConfig(String),
}

pub(crate) fn to_transport_error(err: impl std::fmt::Display) -> CallError {
    CallError::Transport(err.to_string())
}
