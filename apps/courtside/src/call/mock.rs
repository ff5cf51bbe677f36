//! In-memory transport and media doubles for exercising a [`CallSession`]
//! without a network stack or capture devices.
//!
//! [`CallSession`]: super::CallSession

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::CallError;
use super::envelope::{IceCandidate, SessionDescription, UserId};
use super::media::{LocalStream, MediaConstraints, MediaDevices, MediaTrack, TrackKind};
use super::transport::{PeerTransport, TransportEvent, TransportEvents, TransportFactory};

#[derive(Default)]
pub struct MockTransportFactory {
    transports: Mutex<Vec<Arc<MockTransport>>>,
    emit_candidates: AtomicBool,
}

impl MockTransportFactory {
    /// Transports built by this factory announce one host candidate after
    /// each local description is applied.
    pub fn with_candidates() -> Self {
        let factory = Self::default();
        factory.emit_candidates.store(true, Ordering::SeqCst);
        factory
    }

    pub fn created(&self) -> usize {
        self.transports.lock().len()
    }

    /// The most recent transport built for `remote`.
    pub fn transport(&self, remote: UserId) -> Option<Arc<MockTransport>> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|transport| transport.remote() == remote)
            .cloned()
    }

    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.transports.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        events: TransportEvents,
        local: &LocalStream,
    ) -> Result<Arc<dyn PeerTransport>, CallError> {
        let transport = Arc::new(MockTransport::new(
            events,
            local,
            self.emit_candidates.load(Ordering::SeqCst),
        ));
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

pub struct MockTransport {
    events: TransportEvents,
    emit_candidates: bool,
    senders: Mutex<HashMap<TrackKind, Option<Arc<MediaTrack>>>>,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    offers: AtomicUsize,
    answers: AtomicUsize,
    closed: AtomicBool,
}

impl MockTransport {
    fn new(events: TransportEvents, local: &LocalStream, emit_candidates: bool) -> Self {
        let mut senders = HashMap::new();
        for kind in [TrackKind::Audio, TrackKind::Video] {
            if let Some(track) = local.track(kind) {
                senders.insert(kind, Some(Arc::clone(track)));
            }
        }
        Self {
            events,
            emit_candidates,
            senders: Mutex::new(senders),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            offers: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn remote(&self) -> UserId {
        self.events.remote()
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    /// Track currently bound to the sender of `kind`.
    pub fn sent_track(&self, kind: TrackKind) -> Option<Arc<MediaTrack>> {
        self.senders.lock().get(&kind).cloned().flatten()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answers_created(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Injects a transport callback as if the network stack raised it.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.emit(event)
    }

    fn ensure_open(&self) -> Result<(), CallError> {
        if self.is_closed() {
            Err(CallError::Transport("transport closed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        self.ensure_open()?;
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::offer(format!(
            "mock-offer remote={} n={n}",
            self.remote()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        self.ensure_open()?;
        if self.remote_description.lock().is_none() {
            return Err(CallError::Negotiation("no remote offer to answer".into()));
        }
        let n = self.answers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::answer(format!(
            "mock-answer remote={} n={n}",
            self.remote()
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.ensure_open()?;
        *self.local_description.lock() = Some(desc);
        if self.emit_candidates {
            let mut candidate = IceCandidate::new(format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 5000{} typ host",
                self.generation(),
                self.remote() % 10
            ));
            candidate.sdp_mid = Some("0".into());
            candidate.sdp_mline_index = Some(0);
            self.events.emit(TransportEvent::IceCandidate(candidate));
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.ensure_open()?;
        *self.remote_description.lock() = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        self.ensure_open()?;
        if self.remote_description.lock().is_none() {
            return Err(CallError::Negotiation(
                "remote description not set".into(),
            ));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), CallError> {
        self.ensure_open()?;
        self.senders.lock().insert(kind, track);
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockDevices {
    denied: Mutex<Option<String>>,
    last: Mutex<Option<MediaConstraints>>,
    opened: AtomicUsize,
}

impl MockDevices {
    /// Makes every following `open` fail as a denied permission prompt would.
    pub fn deny(&self, reason: impl Into<String>) {
        *self.denied.lock() = Some(reason.into());
    }

    pub fn allow(&self) {
        self.denied.lock().take();
    }

    pub fn last_constraints(&self) -> Option<MediaConstraints> {
        *self.last.lock()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream, CallError> {
        *self.last.lock() = Some(*constraints);
        if let Some(reason) = self.denied.lock().clone() {
            return Err(CallError::MediaAccess(reason));
        }
        if constraints.is_empty() {
            return Err(CallError::MediaAccess("no media kinds requested".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(LocalStream::from_constraints(constraints))
    }
}
