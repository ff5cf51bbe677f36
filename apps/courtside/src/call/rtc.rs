use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_remote::TrackRemote;

use super::envelope::{IceCandidate, SdpKind, SessionDescription};
use super::media::{LocalStream, MediaTrack, TrackKind};
use super::transport::{
    PeerTransport, RemoteTrack, TransportEvent, TransportEvents, TransportFactory, TransportState,
};
use super::{CallError, to_transport_error};
use crate::config::CallConfig;

fn build_api(setting: SettingEngine) -> Result<API, CallError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_transport_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_transport_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Builds webrtc-rs peer connections with the configured ICE servers.
pub struct RtcTransportFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcTransportFactory {
    pub fn new(config: &CallConfig) -> Result<Self, CallError> {
        Ok(Self {
            api: build_api(SettingEngine::default())?,
            ice_servers: config.ice_servers().to_vec(),
        })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    async fn open(
        &self,
        events: TransportEvents,
        local: &LocalStream,
    ) -> Result<RtcTransport, CallError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(to_transport_error)?,
        );

        let mut senders = HashMap::new();
        for track in local.tracks() {
            let sender = pc
                .add_track(track.rtc_track())
                .await
                .map_err(to_transport_error)?;
            tokio::spawn(drain_rtcp(Arc::clone(&sender)));
            senders.insert(track.kind(), sender);
        }
        // Kinds the stream lacks still get a sendrecv line for a later stream
        // to bind to.
        for (kind, codec) in [
            (TrackKind::Audio, RTPCodecType::Audio),
            (TrackKind::Video, RTPCodecType::Video),
        ] {
            if senders.contains_key(&kind) {
                continue;
            }
            let transceiver = pc
                .add_transceiver_from_kind(
                    codec,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendrecv,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(to_transport_error)?;
            let sender = transceiver.sender().await;
            tokio::spawn(drain_rtcp(Arc::clone(&sender)));
            senders.insert(kind, sender);
        }

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        events.emit(TransportEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "rtc", remote = events.remote(), error = %err, "failed to encode local candidate");
                    }
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!(target = "rtc", remote = events.remote(), ?state, "peer connection state changed");
                if let Some(state) = map_state(state) {
                    events.emit(TransportEvent::StateChanged(state));
                }
            })
        }));

        let track_events = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
            let events = track_events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => return,
                };
                events.emit(TransportEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    kind,
                    stream_id: track.stream_id(),
                    rtc: Some(track),
                }));
            })
        }));

        Ok(RtcTransport {
            pc,
            senders: Mutex::new(senders),
        })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        events: TransportEvents,
        local: &LocalStream,
    ) -> Result<Arc<dyn PeerTransport>, CallError> {
        Ok(Arc::new(self.open(events, local).await?))
    }
}

async fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    let mut buf = vec![0u8; 1500];
    while sender.read(&mut buf).await.is_ok() {}
}

fn map_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, CallError> {
    let result = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|err| CallError::Negotiation(err.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, CallError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(CallError::Negotiation(format!(
            "unsupported description type {other}"
        ))),
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| CallError::Negotiation(err.to_string()))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| CallError::Negotiation(err.to_string()))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(|err| CallError::Negotiation(err.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(|err| CallError::Negotiation(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| CallError::Negotiation(err.to_string()))
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), CallError> {
        let sender = self.senders.lock().get(&kind).cloned();
        let Some(sender) = sender else {
            tracing::debug!(target = "rtc", kind = %kind, "no sender for track kind; skipping replace");
            return Ok(());
        };
        sender
            .replace_track(track.map(|track| track.rtc_track()))
            .await
            .map_err(to_transport_error)
    }

    async fn close(&self) -> Result<(), CallError> {
        self.pc.close().await.map_err(to_transport_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::media::MediaConstraints;

    #[test]
    fn peer_connection_states_map_onto_transport_states() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Failed),
            Some(TransportState::Failed)
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Connected),
            Some(TransportState::Connected)
        );
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[test]
    fn rollback_descriptions_are_rejected() {
        let mut desc = RTCSessionDescription::default();
        desc.sdp_type = RTCSdpType::Rollback;
        assert!(matches!(
            from_rtc_description(desc),
            Err(CallError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn audio_only_stream_can_later_send_video() {
        let config = CallConfig::new("http://127.0.0.1:5000")
            .unwrap()
            .with_ice_servers(Vec::new());
        let factory = RtcTransportFactory::new(&config).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let local = LocalStream::from_constraints(&MediaConstraints::for_call(false, true));

        let transport = factory
            .open(TransportEvents::new(2, 1, tx), &local)
            .await
            .unwrap();
        assert!(transport.senders.lock().contains_key(&TrackKind::Video));
        assert!(transport.senders.lock().contains_key(&TrackKind::Audio));

        let video = MediaTrack::new(TrackKind::Video, local.id(), None);
        transport
            .replace_track(TrackKind::Video, Some(video))
            .await
            .unwrap();
        transport.close().await.unwrap();
    }

    #[test]
    fn empty_ice_server_list_yields_no_servers() {
        let config = CallConfig::new("http://127.0.0.1:5000")
            .unwrap()
            .with_ice_servers(Vec::new());
        let factory = RtcTransportFactory::new(&config).unwrap();
        assert!(factory.rtc_configuration().ice_servers.is_empty());
    }
}
