use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::CallError;
use super::envelope::{ServerMessage, UserId};
use super::media::{LocalMedia, LocalStream, MediaDevices, SampleDevices};
use super::negotiation::NegotiationEngine;
use super::network::NetworkStatus;
use super::registry::PeerState;
use super::rtc::RtcTransportFactory;
use super::signaling::SignalingChannel;
use super::subscription::Subscription;
use super::transport::{RemoteStream, TransportFactory};
use crate::config::CallConfig;

/// One group call as seen by the UI. Construct one per call screen and call
/// [`close_all`](Self::close_all) when it goes away.
pub struct CallSession {
    signaling: SignalingChannel,
    media: Arc<LocalMedia>,
    engine: Arc<NegotiationEngine>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl CallSession {
    pub fn new(
        config: &CallConfig,
        factory: Arc<dyn TransportFactory>,
        devices: Arc<dyn MediaDevices>,
        network: NetworkStatus,
    ) -> Result<Self, CallError> {
        let (signaling, inbound) = SignalingChannel::new(config, network)?;
        let media = Arc::new(LocalMedia::new(devices));
        let engine = NegotiationEngine::new(factory, Arc::clone(&media), Arc::new(signaling.clone()));
        Ok(Self {
            signaling,
            media,
            engine,
            inbound: Mutex::new(Some(inbound)),
            dispatch: Mutex::new(None),
        })
    }

    /// A session backed by webrtc-rs peer connections and sample-fed tracks.
    pub fn with_rtc(config: &CallConfig, network: NetworkStatus) -> Result<Self, CallError> {
        let factory = RtcTransportFactory::new(config)?;
        Self::new(config, Arc::new(factory), Arc::new(SampleDevices), network)
    }

    pub async fn connect(&self, session_id: &str, user_id: UserId) -> Result<(), CallError> {
        self.engine.begin(user_id);
        self.ensure_dispatch();
        if let Err(err) = self.signaling.connect(session_id, user_id).await {
            self.engine.end().await;
            return Err(err);
        }
        Ok(())
    }

    fn ensure_dispatch(&self) {
        let Some(mut inbound) = self.inbound.lock().take() else {
            return;
        };
        let engine: Weak<NegotiationEngine> = Arc::downgrade(&self.engine);
        let task = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.handle_server_message(message).await;
            }
        });
        *self.dispatch.lock() = Some(task);
    }

    /// Starts (or restarts) local capture and rebinds every peer to the new
    /// tracks.
    pub async fn start_local_stream(
        &self,
        video: bool,
        audio: bool,
    ) -> Result<Arc<LocalStream>, CallError> {
        let stream = self.media.start(video, audio).await?;
        self.engine
            .local_stream_changed(Some(Arc::clone(&stream)))
            .await;
        Ok(stream)
    }

    pub async fn stop_local_stream(&self) {
        self.media.stop();
        self.engine.local_stream_changed(None).await;
    }

    pub fn toggle_video(&self, enabled: bool) -> bool {
        self.media.toggle_video(enabled)
    }

    pub fn toggle_audio(&self, enabled: bool) -> bool {
        self.media.toggle_audio(enabled)
    }

    pub fn local_stream(&self) -> Option<Arc<LocalStream>> {
        self.media.current()
    }

    pub fn user_stream(&self, remote: UserId) -> Option<Arc<RemoteStream>> {
        self.engine.registry().remote_stream(remote)
    }

    pub fn peer_count(&self) -> usize {
        self.engine.registry().len()
    }

    pub fn peer_state(&self, remote: UserId) -> Option<PeerState> {
        self.engine.registry().state(remote)
    }

    pub fn is_signaling_open(&self) -> bool {
        self.signaling.is_open()
    }

    pub fn pending_reconnect(&self) -> bool {
        self.signaling.pending_reconnect()
    }

    /// Called each time a remote participant's stream gains a track.
    pub fn on_track<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Arc<RemoteStream>) + Send + Sync + 'static,
    {
        self.engine.on_track(callback)
    }

    /// Called once per removed peer with the remote user id.
    pub fn on_user_disconnect<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&UserId) + Send + Sync + 'static,
    {
        self.engine.registry().on_disconnect(callback)
    }

    /// Hangs up: local media, every peer, the signaling socket and any pending
    /// reconnect. Never fails and may be called from any state.
    pub async fn close_all(&self) {
        self.media.stop();
        self.engine.end().await;
        self.signaling.close();
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.signaling.close();
        if let Some(task) = self.dispatch.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::media::{ReadyState, TrackKind};
    use crate::call::mock::{MockDevices, MockTransportFactory};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        session: CallSession,
        factory: Arc<MockTransportFactory>,
        devices: Arc<MockDevices>,
    }

    fn fixture() -> Fixture {
        let config = CallConfig::new("http://127.0.0.1:9").unwrap();
        let factory = Arc::new(MockTransportFactory::default());
        let devices = Arc::new(MockDevices::default());
        let session = CallSession::new(
            &config,
            factory.clone(),
            devices.clone(),
            NetworkStatus::default(),
        )
        .unwrap();
        Fixture {
            session,
            factory,
            devices,
        }
    }

    async fn join_roster(session: &CallSession, local: UserId, users: Vec<UserId>) {
        session.engine.begin(local);
        session
            .engine
            .handle_server_message(ServerMessage::SessionUsers { users })
            .await;
    }

    #[tokio::test]
    async fn close_all_is_exhaustive_and_idempotent() {
        let f = fixture();
        let stream = f.session.start_local_stream(true, true).await.unwrap();
        join_roster(&f.session, 1, vec![2, 3]).await;
        assert_eq!(f.session.peer_count(), 2);

        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disconnects);
        let _sub = f.session.on_user_disconnect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        f.session.close_all().await;
        f.session.close_all().await;

        assert_eq!(f.session.peer_count(), 0);
        assert!(f.session.local_stream().is_none());
        assert!(
            stream
                .tracks()
                .iter()
                .all(|track| track.ready_state() == ReadyState::Ended)
        );
        assert!(!f.session.is_signaling_open());
        assert!(!f.session.pending_reconnect());
        assert!(f.factory.transports().iter().all(|t| t.is_closed()));
        assert_eq!(disconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_all_before_anything_started() {
        let f = fixture();
        f.session.close_all().await;
        assert_eq!(f.session.peer_count(), 0);
    }

    #[tokio::test]
    async fn restarting_media_keeps_peers() {
        let f = fixture();
        f.session.start_local_stream(true, true).await.unwrap();
        join_roster(&f.session, 1, vec![2, 3]).await;

        let replacement = f.session.start_local_stream(true, true).await.unwrap();

        assert_eq!(f.factory.created(), 2);
        assert_eq!(f.session.peer_count(), 2);
        for remote in [2, 3] {
            let transport = f.factory.transport(remote).unwrap();
            assert!(Arc::ptr_eq(
                &transport.sent_track(TrackKind::Video).unwrap(),
                replacement.track(TrackKind::Video).unwrap()
            ));
        }
    }

    #[tokio::test]
    async fn stopping_media_unbinds_senders() {
        let f = fixture();
        f.session.start_local_stream(true, true).await.unwrap();
        join_roster(&f.session, 1, vec![2]).await;

        f.session.stop_local_stream().await;

        let transport = f.factory.transport(2).unwrap();
        assert!(transport.sent_track(TrackKind::Audio).is_none());
        assert!(f.session.local_stream().is_none());
        assert_eq!(f.session.peer_count(), 1);
    }

    #[tokio::test]
    async fn media_denial_reaches_caller() {
        let f = fixture();
        f.devices.deny("NotAllowedError: Permission denied");
        let err = f.session.start_local_stream(true, true).await.unwrap_err();
        assert!(matches!(err, CallError::MediaAccess(_)));
        assert!(!f.session.toggle_video(false));
    }

    #[tokio::test]
    async fn unsubscribed_disconnect_listener_never_fires() {
        let f = fixture();
        f.session.start_local_stream(true, true).await.unwrap();
        join_roster(&f.session, 1, vec![2, 3]).await;

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sub = f.session.on_user_disconnect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        f.session
            .engine
            .handle_server_message(ServerMessage::UserLeft { user_id: 2 })
            .await;
        sub.unsubscribe();
        f.session
            .engine
            .handle_server_message(ServerMessage::UserLeft { user_id: 3 })
            .await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(f.session.peer_count(), 0);
    }

    #[tokio::test]
    async fn failed_connect_surfaces_signaling_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let config = CallConfig::new(format!("http://{addr}")).unwrap();
        let session = CallSession::new(
            &config,
            Arc::new(MockTransportFactory::default()),
            Arc::new(MockDevices::default()),
            NetworkStatus::default(),
        )
        .unwrap();

        let err = session.connect("S1", 1).await.unwrap_err();
        assert!(matches!(err, CallError::SignalingUnavailable(_)));
        assert!(!session.pending_reconnect());
        session.close_all().await;
    }
}
