use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{CallError, to_transport_error};

/// Capture size requested whenever video is enabled.
pub const CAPTURE_WIDTH: u32 = 1280;
pub const CAPTURE_HEIGHT: u32 = 720;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Live,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: bool,
}

impl MediaConstraints {
    pub fn for_call(video: bool, audio: bool) -> Self {
        Self {
            video: video.then_some(VideoConstraints {
                width: CAPTURE_WIDTH,
                height: CAPTURE_HEIGHT,
            }),
            audio,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && !self.audio
    }
}

/// One outgoing audio or video track. Muting flips `enabled` and keeps the
/// underlying RTP track bound to every sender it was attached to.
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    ended: AtomicBool,
    video: Option<VideoConstraints>,
    rtc: Arc<TrackLocalStaticSample>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, stream_id: &str, video: Option<VideoConstraints>) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec_for(kind),
            id.clone(),
            stream_id.to_string(),
        ));
        Arc::new(Self {
            id,
            kind,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            video,
            rtc,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn video_constraints(&self) -> Option<VideoConstraints> {
        self.video
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn ready_state(&self) -> ReadyState {
        if self.ended.load(Ordering::SeqCst) {
            ReadyState::Ended
        } else {
            ReadyState::Live
        }
    }

    pub fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.rtc) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Pushes one encoded frame to every bound sender. Returns `false` when the
    /// sample was dropped because the track is muted or stopped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, CallError> {
        if !self.is_enabled() || self.ready_state() == ReadyState::Ended {
            return Ok(false);
        }
        self.rtc
            .write_sample(sample)
            .await
            .map_err(to_transport_error)?;
        Ok(true)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
    }
}

#[derive(Debug)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl LocalStream {
    /// Builds a stream with one track per requested kind.
    pub fn from_constraints(constraints: &MediaConstraints) -> Self {
        let id = Uuid::new_v4().to_string();
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, &id, None));
        }
        if let Some(video) = constraints.video {
            tracks.push(MediaTrack::new(TrackKind::Video, &id, Some(video)));
        }
        Self { id, tracks }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(move |track| track.kind() == kind)
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<MediaTrack>> {
        self.tracks_of(kind).next()
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_live(&self) -> bool {
        self.tracks
            .iter()
            .any(|track| track.ready_state() == ReadyState::Live)
    }
}

/// Source of local capture streams.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream, CallError>;
}

/// Devices backed by sample-fed RTP tracks: the embedding application encodes
/// frames itself and pushes them with [`MediaTrack::write_sample`].
#[derive(Debug, Default, Clone)]
pub struct SampleDevices;

#[async_trait]
impl MediaDevices for SampleDevices {
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream, CallError> {
        if constraints.is_empty() {
            return Err(CallError::MediaAccess(
                "at least one of audio or video must be requested".into(),
            ));
        }
        Ok(LocalStream::from_constraints(constraints))
    }
}

pub struct LocalMedia {
    devices: Arc<dyn MediaDevices>,
    stream: RwLock<Option<Arc<LocalStream>>>,
}

impl LocalMedia {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            stream: RwLock::new(None),
        }
    }

    pub fn current(&self) -> Option<Arc<LocalStream>> {
        self.stream.read().clone()
    }

    pub async fn start(&self, video: bool, audio: bool) -> Result<Arc<LocalStream>, CallError> {
        self.stop();
        let constraints = MediaConstraints::for_call(video, audio);
        let stream = match self.devices.open(&constraints).await {
            Ok(stream) => Arc::new(stream),
            Err(CallError::MediaAccess(reason)) => return Err(CallError::MediaAccess(reason)),
            Err(other) => return Err(CallError::MediaAccess(other.to_string())),
        };
        // A concurrent start may have stored its own stream meanwhile.
        if let Some(previous) = self.stream.write().replace(Arc::clone(&stream)) {
            previous.stop();
        }
        tracing::info!(
            target = "media",
            stream_id = %stream.id(),
            video,
            audio,
            "local stream started"
        );
        Ok(stream)
    }

    pub fn toggle_video(&self, enabled: bool) -> bool {
        self.toggle(TrackKind::Video, enabled)
    }

    pub fn toggle_audio(&self, enabled: bool) -> bool {
        self.toggle(TrackKind::Audio, enabled)
    }

    fn toggle(&self, kind: TrackKind, enabled: bool) -> bool {
        let Some(stream) = self.current() else {
            return false;
        };
        let mut touched = false;
        for track in stream.tracks_of(kind) {
            track.set_enabled(enabled);
            touched = true;
        }
        if touched {
            tracing::debug!(target = "media", kind = %kind, enabled, "toggled local tracks");
        }
        touched
    }

    pub fn stop(&self) {
        if let Some(stream) = self.stream.write().take() {
            stream.stop();
            tracing::info!(target = "media", stream_id = %stream.id(), "local stream stopped");
        }
    }
}
