use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::envelope::{IceCandidate, SdpKind, ServerMessage, SessionDescription, SignalPayload, UserId};
use super::media::{LocalMedia, LocalStream, TrackKind};
use super::registry::{PeerCommand, PeerHandle, PeerRegistry, PeerState};
use super::signaling::SignalSink;
use super::subscription::{Listeners, Subscription};
use super::transport::{PeerEvent, RemoteStream, TransportEvent, TransportFactory, TransportState};
use super::CallError;

/// Candidates held for a peer that has no entry yet.
const MAX_PARKED_CANDIDATES: usize = 32;
/// Candidates held by a worker until the remote description is applied.
const MAX_PENDING_CANDIDATES: usize = 64;

#[derive(Default)]
struct Parked {
    offer: Option<SessionDescription>,
    candidates: VecDeque<IceCandidate>,
}

/// Drives offer/answer/ICE exchange for every remote participant. The lower
/// user id of a pair always sends the offer.
pub(crate) struct NegotiationEngine {
    registry: Arc<PeerRegistry>,
    media: Arc<LocalMedia>,
    sink: Arc<dyn SignalSink>,
    local_user: Mutex<Option<UserId>>,
    roster: Mutex<BTreeSet<UserId>>,
    parked: Mutex<HashMap<UserId, Parked>>,
    /// `session-users` rosters seen since `begin`; every one after the first
    /// means our socket rejoined.
    rosters: AtomicUsize,
    tracks: Listeners<Arc<RemoteStream>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl NegotiationEngine {
    pub(crate) fn new(
        factory: Arc<dyn TransportFactory>,
        media: Arc<LocalMedia>,
        sink: Arc<dyn SignalSink>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            registry: Arc::new(PeerRegistry::new(factory, events_tx)),
            media,
            sink,
            local_user: Mutex::new(None),
            roster: Mutex::new(BTreeSet::new()),
            parked: Mutex::new(HashMap::new()),
            rosters: AtomicUsize::new(0),
            tracks: Listeners::new(),
            events: Mutex::new(Some(events_rx)),
            event_task: Mutex::new(None),
        })
    }

    pub(crate) fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub(crate) fn local_user(&self) -> Option<UserId> {
        *self.local_user.lock()
    }

    pub(crate) fn roster(&self) -> Vec<UserId> {
        self.roster.lock().iter().copied().collect()
    }

    pub(crate) fn on_track<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Arc<RemoteStream>) + Send + Sync + 'static,
    {
        self.tracks.subscribe(callback)
    }

    /// Anchors the engine to the local participant and starts consuming
    /// transport events.
    pub(crate) fn begin(self: &Arc<Self>, local_user: UserId) {
        *self.local_user.lock() = Some(local_user);
        self.rosters.store(0, Ordering::SeqCst);
        let Some(rx) = self.events.lock().take() else {
            return;
        };
        let engine = Arc::downgrade(self);
        *self.event_task.lock() = Some(tokio::spawn(run_events(engine, rx)));
    }

    pub(crate) async fn handle_server_message(self: &Arc<Self>, message: ServerMessage) {
        if self.local_user().is_none() {
            tracing::debug!(target = "negotiation", ?message, "ignoring message outside a call");
            return;
        }
        match message {
            ServerMessage::SessionUsers { users } => {
                tracing::info!(target = "negotiation", count = users.len(), "received session roster");
                if self.rosters.fetch_add(1, Ordering::SeqCst) > 0 {
                    self.rejoined(&users).await;
                }
                for user in users {
                    self.peer_present(user).await;
                }
            }
            ServerMessage::UserJoined { user_id } => {
                tracing::info!(target = "negotiation", remote = user_id, "user joined");
                // A second announcement means the remote reconnected and
                // dropped its side of the pair.
                if self.registry.remove(user_id).await {
                    tracing::info!(target = "negotiation", remote = user_id, "user rejoined; restarting peer");
                }
                self.peer_present(user_id).await;
            }
            ServerMessage::Signal { user_id, signal } => {
                self.handle_signal(user_id, signal).await;
            }
            ServerMessage::UserLeft { user_id } => {
                tracing::info!(target = "negotiation", remote = user_id, "user left");
                self.roster.lock().remove(&user_id);
                self.parked.lock().remove(&user_id);
                self.registry.remove(user_id).await;
            }
        }
    }

    /// Every remote already dropped us while our socket was down, so the
    /// existing entries are dead ends. Start over from the fresh roster.
    async fn rejoined(&self, users: &[UserId]) {
        let listed: BTreeSet<UserId> = users.iter().copied().collect();
        self.roster.lock().retain(|user| listed.contains(user));
        self.parked.lock().clear();
        let removed = self.registry.clear().await;
        tracing::info!(target = "negotiation", removed, "rejoined session; restarting peers");
    }

    async fn peer_present(self: &Arc<Self>, remote: UserId) {
        let Some(local_user) = self.local_user() else {
            return;
        };
        if remote == local_user {
            return;
        }
        self.roster.lock().insert(remote);
        self.ensure_peer(remote, local_user < remote).await;
    }

    async fn handle_signal(self: &Arc<Self>, remote: UserId, signal: SignalPayload) {
        tracing::debug!(target = "negotiation", remote, kind = signal.label(), "inbound signal");
        if let Some(handle) = self.registry.get(remote) {
            if !handle.send(PeerCommand::Signal(signal)) {
                tracing::debug!(target = "negotiation", remote, "peer worker gone; signal dropped");
            }
            return;
        }

        match signal {
            SignalPayload::Description(desc) if desc.kind == SdpKind::Offer => {
                self.roster.lock().insert(remote);
                {
                    let mut parked = self.parked.lock();
                    let slot = parked.entry(remote).or_default();
                    slot.offer = Some(desc);
                    slot.candidates.clear();
                }
                // The offer decides the direction for this pair.
                self.ensure_peer(remote, false).await;
            }
            SignalPayload::Description(desc) => {
                tracing::debug!(
                    target = "negotiation",
                    remote,
                    kind = desc.kind.as_str(),
                    "description for unknown peer dropped"
                );
            }
            SignalPayload::Candidate { candidate } => {
                {
                    let mut parked = self.parked.lock();
                    let slot = parked.entry(remote).or_default();
                    if slot.candidates.len() == MAX_PARKED_CANDIDATES {
                        slot.candidates.pop_front();
                    }
                    slot.candidates.push_back(candidate);
                }
                if let Some(handle) = self.registry.get(remote) {
                    self.replay_parked(&handle);
                }
            }
        }
    }

    /// Creates the entry for `remote` when possible and starts its worker.
    async fn ensure_peer(self: &Arc<Self>, remote: UserId, initiator: bool) -> Option<Arc<PeerHandle>> {
        let local = self.media.current();
        let slot = self
            .registry
            .get_or_create(remote, initiator, local.as_deref())
            .await?;
        let handle = slot.handle;
        if slot.commands.is_some() && self.local_user().is_none() {
            // The call ended while the transport was being built.
            self.registry
                .remove_generation(remote, handle.generation())
                .await;
            return None;
        }
        if let Some(commands) = slot.commands {
            let worker = PeerWorker::new(
                Arc::clone(&handle),
                Arc::clone(&self.registry),
                Arc::clone(&self.sink),
            );
            tokio::spawn(worker.run(commands));
            let answered = self.replay_parked(&handle);
            if handle.is_initiator() && !answered {
                handle.send(PeerCommand::StartOffer);
            }
        }
        Some(handle)
    }

    /// Hands any parked signals to the peer worker. Returns whether an offer
    /// was among them.
    fn replay_parked(&self, handle: &PeerHandle) -> bool {
        let Some(parked) = self.parked.lock().remove(&handle.remote()) else {
            return false;
        };
        let had_offer = parked.offer.is_some();
        if let Some(offer) = parked.offer {
            handle.send(PeerCommand::Signal(offer.into()));
        }
        for candidate in parked.candidates {
            handle.send(PeerCommand::Signal(candidate.into()));
        }
        had_offer
    }

    /// Rebinds every transport to `stream`'s tracks in place, then brings up
    /// peers that were waiting for local media.
    pub(crate) async fn local_stream_changed(self: &Arc<Self>, stream: Option<Arc<LocalStream>>) {
        for handle in self.registry.handles() {
            for kind in [TrackKind::Audio, TrackKind::Video] {
                let track = stream
                    .as_ref()
                    .and_then(|stream| stream.track(kind).cloned());
                if let Err(err) = handle.transport().replace_track(kind, track).await {
                    tracing::warn!(
                        target = "negotiation",
                        remote = handle.remote(),
                        kind = %kind,
                        error = %err,
                        "failed to replace outgoing track"
                    );
                }
            }
        }
        if stream.is_none() {
            return;
        }
        for remote in self.roster() {
            self.peer_present(remote).await;
        }
    }

    /// Forgets the call: roster, parked signals and every peer entry.
    pub(crate) async fn end(&self) {
        self.local_user.lock().take();
        self.rosters.store(0, Ordering::SeqCst);
        self.roster.lock().clear();
        self.parked.lock().clear();
        let removed = self.registry.clear().await;
        if removed > 0 {
            tracing::info!(target = "negotiation", removed, "closed all peers");
        }
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        let PeerEvent {
            remote,
            generation,
            event,
        } = event;
        match event {
            TransportEvent::IceCandidate(candidate) => {
                if self.registry.current(remote, generation).is_some() {
                    self.sink.send_signal(remote, candidate.into());
                }
            }
            TransportEvent::StateChanged(state) => {
                tracing::debug!(target = "negotiation", remote, generation, ?state, "transport state");
                if state == TransportState::Connected {
                    self.registry.set_state(remote, generation, PeerState::Connected);
                } else if state.is_terminal() {
                    self.registry.remove_generation(remote, generation).await;
                }
            }
            TransportEvent::RemoteTrack(track) => {
                let kind = track.kind;
                if let Some(stream) = self.registry.attach_remote_track(remote, generation, track) {
                    tracing::info!(target = "negotiation", remote, kind = %kind, "remote track received");
                    self.tracks.emit(&stream);
                }
            }
        }
    }
}

impl Drop for NegotiationEngine {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
    }
}

async fn run_events(engine: Weak<NegotiationEngine>, mut rx: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        engine.handle_peer_event(event).await;
    }
}

/// Processes one peer's commands in arrival order.
struct PeerWorker {
    handle: Arc<PeerHandle>,
    registry: Arc<PeerRegistry>,
    sink: Arc<dyn SignalSink>,
    awaiting_answer: bool,
    remote_set: bool,
    pending: Vec<IceCandidate>,
}

impl PeerWorker {
    fn new(handle: Arc<PeerHandle>, registry: Arc<PeerRegistry>, sink: Arc<dyn SignalSink>) -> Self {
        Self {
            handle,
            registry,
            sink,
            awaiting_answer: false,
            remote_set: false,
            pending: Vec::new(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PeerCommand>) {
        let remote = self.handle.remote();
        while let Some(command) = commands.recv().await {
            let result = match command {
                PeerCommand::StartOffer => self.offer().await,
                PeerCommand::Signal(signal) => self.apply(signal).await,
            };
            if let Err(err) = result {
                if self.is_current() {
                    tracing::warn!(target = "negotiation", remote, error = %err, "negotiation step failed");
                } else {
                    tracing::debug!(target = "negotiation", remote, error = %err, "peer torn down mid-negotiation");
                    break;
                }
            }
        }
        tracing::trace!(target = "negotiation", remote, "peer worker finished");
    }

    fn is_current(&self) -> bool {
        self.registry
            .current(self.handle.remote(), self.handle.generation())
            .is_some()
    }

    fn send(&self, signal: SignalPayload) {
        if self.is_current() {
            self.sink.send_signal(self.handle.remote(), signal);
        }
    }

    async fn offer(&mut self) -> Result<(), CallError> {
        if !self.is_current() {
            return Ok(());
        }
        self.handle.set_state(PeerState::Negotiating);
        let transport = self.handle.transport();
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        self.awaiting_answer = true;
        tracing::debug!(target = "negotiation", remote = self.handle.remote(), "sending offer");
        self.send(offer.into());
        Ok(())
    }

    async fn apply(&mut self, signal: SignalPayload) -> Result<(), CallError> {
        let remote = self.handle.remote();
        match signal {
            SignalPayload::Description(desc) => match desc.kind {
                SdpKind::Offer => {
                    if self.awaiting_answer {
                        tracing::debug!(target = "negotiation", remote, "glare: ignoring offer while ours is outstanding");
                        return Ok(());
                    }
                    self.handle.set_state(PeerState::Negotiating);
                    let transport = Arc::clone(self.handle.transport());
                    transport.set_remote_description(desc).await?;
                    self.remote_set = true;
                    self.flush_pending().await;
                    let answer = transport.create_answer().await?;
                    transport.set_local_description(answer.clone()).await?;
                    tracing::debug!(target = "negotiation", remote, "sending answer");
                    self.send(answer.into());
                }
                SdpKind::Answer => {
                    if !self.awaiting_answer {
                        tracing::debug!(target = "negotiation", remote, "unexpected answer ignored");
                        return Ok(());
                    }
                    self.handle.transport().set_remote_description(desc).await?;
                    self.awaiting_answer = false;
                    self.remote_set = true;
                    self.flush_pending().await;
                }
            },
            SignalPayload::Candidate { candidate } => {
                if !self.remote_set {
                    if self.pending.len() == MAX_PENDING_CANDIDATES {
                        self.pending.remove(0);
                    }
                    self.pending.push(candidate);
                    return Ok(());
                }
                self.handle.transport().add_ice_candidate(candidate).await?;
            }
        }
        Ok(())
    }

    async fn flush_pending(&mut self) {
        for candidate in std::mem::take(&mut self.pending) {
            if let Err(err) = self.handle.transport().add_ice_candidate(candidate).await {
                tracing::debug!(
                    target = "negotiation",
                    remote = self.handle.remote(),
                    error = %err,
                    "queued candidate rejected"
                );
            }
        }
    }
}
