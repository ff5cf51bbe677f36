use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use super::envelope::{SignalPayload, UserId};
use super::media::LocalStream;
use super::subscription::{Listeners, Subscription};
use super::transport::{
    PeerEvent, PeerTransport, RemoteStream, RemoteTrack, TransportEvents, TransportFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Negotiating,
    Connected,
    Closed,
}

/// Work queued for a peer's negotiation worker.
#[derive(Debug, Clone)]
pub enum PeerCommand {
    StartOffer,
    Signal(SignalPayload),
}

/// One remote participant. The transport is reachable only through this
/// handle.
pub struct PeerHandle {
    remote: UserId,
    generation: u64,
    initiator: bool,
    transport: Arc<dyn PeerTransport>,
    state: Mutex<PeerState>,
    remote_stream: Mutex<Option<Arc<RemoteStream>>>,
    commands: Mutex<Option<mpsc::UnboundedSender<PeerCommand>>>,
}

impl PeerHandle {
    pub fn remote(&self) -> UserId {
        self.remote
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    pub fn remote_stream(&self) -> Option<Arc<RemoteStream>> {
        self.remote_stream.lock().clone()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// Moves the entry forward; `Closed` is final.
    pub(crate) fn set_state(&self, next: PeerState) -> bool {
        let mut state = self.state.lock();
        if *state == PeerState::Closed || *state == next {
            return false;
        }
        *state = next;
        true
    }

    /// Queues a command for the worker. Returns `false` once the entry has
    /// been removed.
    pub(crate) fn send(&self, command: PeerCommand) -> bool {
        match self.commands.lock().as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("remote", &self.remote)
            .field("generation", &self.generation)
            .field("initiator", &self.initiator)
            .field("state", &self.state())
            .finish()
    }
}

/// Result of [`PeerRegistry::get_or_create`]. `commands` is present only when
/// this call created the entry; the caller then owns running its worker.
pub struct PeerSlot {
    pub handle: Arc<PeerHandle>,
    pub commands: Option<mpsc::UnboundedReceiver<PeerCommand>>,
}

impl PeerSlot {
    pub fn created(&self) -> bool {
        self.commands.is_some()
    }
}

pub struct PeerRegistry {
    entries: Mutex<HashMap<UserId, Arc<PeerHandle>>>,
    creating: AsyncMutex<()>,
    factory: Arc<dyn TransportFactory>,
    events: mpsc::UnboundedSender<PeerEvent>,
    next_generation: AtomicU64,
    disconnects: Listeners<UserId>,
}

impl PeerRegistry {
    pub(crate) fn new(
        factory: Arc<dyn TransportFactory>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            creating: AsyncMutex::new(()),
            factory,
            events,
            next_generation: AtomicU64::new(1),
            disconnects: Listeners::new(),
        }
    }

    /// Returns the entry for `remote`, creating it with a fresh transport when
    /// absent. Creation needs a local stream; without one nothing is created.
    pub async fn get_or_create(
        &self,
        remote: UserId,
        initiator: bool,
        local: Option<&LocalStream>,
    ) -> Option<PeerSlot> {
        if let Some(handle) = self.get(remote) {
            return Some(PeerSlot {
                handle,
                commands: None,
            });
        }
        let Some(local) = local else {
            tracing::debug!(
                target = "peers",
                remote,
                "no local stream yet; deferring peer creation"
            );
            return None;
        };

        let _creating = self.creating.lock().await;
        if let Some(handle) = self.get(remote) {
            return Some(PeerSlot {
                handle,
                commands: None,
            });
        }
        // Teardown may have stopped the stream while we queued on the lock.
        if !local.is_live() {
            tracing::debug!(target = "peers", remote, "local stream ended; not creating peer");
            return None;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let events = TransportEvents::new(remote, generation, self.events.clone());
        let transport = match self.factory.create(events, local).await {
            Ok(transport) => transport,
            Err(err) => {
                tracing::warn!(target = "peers", remote, error = %err, "failed to create peer transport");
                return None;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(PeerHandle {
            remote,
            generation,
            initiator,
            transport,
            state: Mutex::new(PeerState::New),
            remote_stream: Mutex::new(None),
            commands: Mutex::new(Some(tx)),
        });
        self.entries.lock().insert(remote, Arc::clone(&handle));
        tracing::info!(
            target = "peers",
            remote,
            generation,
            initiator,
            "peer entry created"
        );
        Some(PeerSlot {
            handle,
            commands: Some(rx),
        })
    }

    pub fn get(&self, remote: UserId) -> Option<Arc<PeerHandle>> {
        self.entries.lock().get(&remote).cloned()
    }

    /// Closes and forgets the entry for `remote`, notifying disconnect
    /// listeners once.
    pub async fn remove(&self, remote: UserId) -> bool {
        let Some(handle) = self.entries.lock().remove(&remote) else {
            return false;
        };
        self.retire(handle).await;
        true
    }

    /// Like [`remove`](Self::remove) but only when the current entry still has
    /// `generation`.
    pub async fn remove_generation(&self, remote: UserId, generation: u64) -> bool {
        let handle = {
            let mut entries = self.entries.lock();
            match entries.get(&remote) {
                Some(current) if current.generation == generation => entries.remove(&remote),
                _ => None,
            }
        };
        match handle {
            Some(handle) => {
                self.retire(handle).await;
                true
            }
            None => false,
        }
    }

    /// Removes every entry. Waits for an in-flight creation so nothing is
    /// inserted behind the sweep.
    pub async fn clear(&self) -> usize {
        let _creating = self.creating.lock().await;
        let drained: Vec<Arc<PeerHandle>> = self.entries.lock().drain().map(|(_, h)| h).collect();
        let count = drained.len();
        for handle in drained {
            self.retire(handle).await;
        }
        count
    }

    async fn retire(&self, handle: Arc<PeerHandle>) {
        handle.set_state(PeerState::Closed);
        handle.commands.lock().take();
        if let Err(err) = handle.transport.close().await {
            tracing::debug!(target = "peers", remote = handle.remote, error = %err, "transport close failed");
        }
        tracing::info!(
            target = "peers",
            remote = handle.remote,
            generation = handle.generation,
            "peer entry removed"
        );
        self.disconnects.emit(&handle.remote);
    }

    /// Returns the entry only if it still has `generation`.
    pub(crate) fn current(&self, remote: UserId, generation: u64) -> Option<Arc<PeerHandle>> {
        self.get(remote)
            .filter(|handle| handle.generation == generation)
    }

    pub(crate) fn set_state(&self, remote: UserId, generation: u64, state: PeerState) -> bool {
        match self.current(remote, generation) {
            Some(handle) => handle.set_state(state),
            None => false,
        }
    }

    /// Records an inbound track; returns the stream when the track is new.
    pub(crate) fn attach_remote_track(
        &self,
        remote: UserId,
        generation: u64,
        track: RemoteTrack,
    ) -> Option<Arc<RemoteStream>> {
        let handle = self.current(remote, generation)?;
        let stream = {
            let mut slot = handle.remote_stream.lock();
            Arc::clone(slot.get_or_insert_with(|| Arc::new(RemoteStream::new(remote))))
        };
        stream.add_track(track).then_some(stream)
    }

    pub fn handles(&self) -> Vec<Arc<PeerHandle>> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, remote: UserId) -> bool {
        self.entries.lock().contains_key(&remote)
    }

    pub fn state(&self, remote: UserId) -> Option<PeerState> {
        self.get(remote).map(|handle| handle.state())
    }

    pub fn remote_stream(&self, remote: UserId) -> Option<Arc<RemoteStream>> {
        self.get(remote).and_then(|handle| handle.remote_stream())
    }

    pub fn on_disconnect<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&UserId) + Send + Sync + 'static,
    {
        self.disconnects.subscribe(callback)
    }
}
