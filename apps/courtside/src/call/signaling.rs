use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use super::CallError;
use super::envelope::{
    ClientMessage, ServerMessage, SignalPayload, UserId, decode_server_message,
    encode_client_message,
};
use super::network::NetworkStatus;
use crate::config::CallConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound path for `signal` envelopes. Sends are best effort: `false` means
/// the envelope was dropped.
pub trait SignalSink: Send + Sync {
    fn send_signal(&self, receiver: UserId, signal: SignalPayload) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: String,
    pub user_id: UserId,
}

/// The single WebSocket to the signaling relay. Cloning shares the socket.
#[derive(Clone)]
pub struct SignalingChannel {
    shared: Arc<ChannelShared>,
}

struct ChannelShared {
    endpoint: Url,
    reconnect_delay: Duration,
    keepalive: Duration,
    identity: Mutex<Option<SessionIdentity>>,
    socket: Mutex<Option<OpenSocket>>,
    epoch: AtomicU64,
    connecting: AsyncMutex<()>,
    reconnect: ReconnectTimer,
    inbound: mpsc::UnboundedSender<ServerMessage>,
    network: NetworkStatus,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

struct OpenSocket {
    epoch: u64,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

impl Drop for OpenSocket {
    // The writer is left to drain and send the close frame once `outbound`
    // is dropped.
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl SignalingChannel {
    pub fn new(
        config: &CallConfig,
        network: NetworkStatus,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>), CallError> {
        let endpoint = derive_websocket_url(config.origin(), config.signaling_path())?;
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ChannelShared {
            endpoint,
            reconnect_delay: config.reconnect_delay(),
            keepalive: config.keepalive_interval(),
            identity: Mutex::new(None),
            socket: Mutex::new(None),
            epoch: AtomicU64::new(0),
            connecting: AsyncMutex::new(()),
            reconnect: ReconnectTimer::default(),
            inbound,
            network,
            watcher: Mutex::new(None),
        });
        Ok((Self { shared }, inbound_rx))
    }

    pub fn endpoint(&self) -> &Url {
        &self.shared.endpoint
    }

    /// Opens the socket and sends `join-session`. A failure here is reported
    /// to the caller and leaves no identity or reconnect behind.
    pub async fn connect(&self, session_id: &str, user_id: UserId) -> Result<(), CallError> {
        let identity = SessionIdentity {
            session_id: session_id.to_string(),
            user_id,
        };
        let shared = &self.shared;
        shared.reconnect.cancel();
        shared.socket.lock().take();
        *shared.identity.lock() = Some(identity.clone());
        shared.ensure_watcher();

        match shared.open(&identity).await {
            Ok(()) => {
                tracing::info!(
                    target = "signaling",
                    url = %shared.endpoint,
                    session_id,
                    user_id,
                    "joined signaling session"
                );
                Ok(())
            }
            Err(err) => {
                {
                    let mut current = shared.identity.lock();
                    if current.as_ref() == Some(&identity) {
                        current.take();
                    }
                }
                tracing::warn!(
                    target = "signaling",
                    url = %shared.endpoint,
                    error = %err,
                    "initial signaling connect failed"
                );
                Err(err)
            }
        }
    }

    /// Cancels any pending reconnect, closes the socket and forgets the
    /// identity. Safe to call repeatedly.
    pub fn close(&self) {
        let shared = &self.shared;
        let had_identity = shared.identity.lock().take().is_some();
        shared.reconnect.cancel();
        let had_socket = shared.socket.lock().take().is_some();
        if had_identity || had_socket {
            tracing::info!(target = "signaling", "signaling channel closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    pub fn identity(&self) -> Option<SessionIdentity> {
        self.shared.identity.lock().clone()
    }

    pub fn pending_reconnect(&self) -> bool {
        self.shared.reconnect.is_pending()
    }
}

impl SignalSink for SignalingChannel {
    fn send_signal(&self, receiver: UserId, signal: SignalPayload) -> bool {
        let Some(identity) = self.identity() else {
            tracing::debug!(target = "signaling", receiver, "no active session; signal dropped");
            return false;
        };
        let message = ClientMessage::Signal {
            user_id: identity.user_id,
            receiver_id: receiver,
            session_id: identity.session_id,
            signal,
        };
        self.shared.send(&message)
    }
}

impl ChannelShared {
    fn is_open(&self) -> bool {
        self.socket.lock().is_some()
    }

    fn send(&self, message: &ClientMessage) -> bool {
        let text = match encode_client_message(message) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(target = "signaling", error = %err, "failed to encode envelope");
                return false;
            }
        };
        let socket = self.socket.lock();
        match socket.as_ref() {
            Some(open) => open.outbound.send(Message::Text(text)).is_ok(),
            None => {
                tracing::debug!(target = "signaling", "socket not open; envelope dropped");
                false
            }
        }
    }

    async fn open(self: &Arc<Self>, identity: &SessionIdentity) -> Result<(), CallError> {
        let _connecting = self.connecting.lock().await;
        if self.is_open() {
            return Ok(());
        }
        let (ws_stream, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|err| CallError::SignalingUnavailable(format!("{}: {err}", self.endpoint)))?;
        let join = encode_client_message(&ClientMessage::JoinSession {
            user_id: identity.user_id,
            session_id: identity.session_id.clone(),
        })
        .map_err(|err| CallError::SignalingUnavailable(err.to_string()))?;

        let mut slot = self.socket.lock();
        if self.identity.lock().as_ref() != Some(identity) {
            return Err(CallError::SignalingUnavailable(
                "call ended while connecting".into(),
            ));
        }
        let (ws_write, ws_read) = ws_stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        // Cannot fail: the receiver is alive until the writer exits.
        let _ = outbound.send(Message::Text(join));
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(write_loop(ws_write, outbound_rx, self.keepalive));
        let reader = tokio::spawn(read_loop(
            Arc::downgrade(self),
            ws_read,
            epoch,
            self.inbound.clone(),
        ));
        *slot = Some(OpenSocket {
            epoch,
            outbound,
            reader,
        });
        tracing::debug!(target = "signaling", epoch, "signaling socket open; join queued");
        Ok(())
    }

    fn socket_closed(self: &Arc<Self>, epoch: u64) {
        {
            let mut socket = self.socket.lock();
            if socket.as_ref().map(|open| open.epoch) != Some(epoch) {
                return;
            }
            socket.take();
        }
        if self.identity.lock().is_some() {
            tracing::warn!(
                target = "signaling",
                delay_ms = self.reconnect_delay.as_millis() as u64,
                "signaling socket dropped; scheduling reconnect"
            );
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.reconnect.schedule(self.reconnect_delay, move |token| async move {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.reconnect.take(token) {
                shared.reconnect_now().await;
            }
        });
    }

    async fn reconnect_now(self: &Arc<Self>) {
        let Some(identity) = self.identity.lock().clone() else {
            return;
        };
        if self.is_open() {
            return;
        }
        tracing::info!(target = "signaling", user_id = identity.user_id, "reconnecting to signaling relay");
        match self.open(&identity).await {
            Ok(()) => {
                tracing::info!(target = "signaling", session_id = %identity.session_id, "signaling reconnected");
            }
            Err(err) => {
                if self.identity.lock().is_some() {
                    tracing::warn!(target = "signaling", error = %err, "reconnect failed; retrying later");
                    self.schedule_reconnect();
                }
            }
        }
    }

    fn ensure_watcher(self: &Arc<Self>) {
        let mut watcher = self.watcher.lock();
        if watcher.is_none() {
            let rx = self.network.subscribe();
            *watcher = Some(tokio::spawn(watch_network(Arc::downgrade(self), rx)));
        }
    }
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        self.reconnect.cancel();
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
    }
}

async fn write_loop(
    mut ws_write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    keepalive: Duration,
) {
    let start = tokio::time::Instant::now() + keepalive;
    let mut ticker = tokio::time::interval_at(start, keepalive);
    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(message) => {
                    if ws_write.send(message).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws_write.close().await;
                    break;
                }
            },
            _ = ticker.tick() => {
                tracing::trace!(target = "signaling", "keepalive ping");
                if ws_write.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    shared: Weak<ChannelShared>,
    mut ws_read: SplitStream<WsStream>,
    epoch: u64,
    inbound: mpsc::UnboundedSender<ServerMessage>,
) {
    while let Some(frame) = ws_read.next().await {
        match frame {
            Ok(Message::Text(text)) => deliver(&inbound, &text),
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => deliver(&inbound, &text),
                Err(_) => tracing::debug!(target = "signaling", "ignoring non-utf8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                tracing::debug!(target = "signaling", ?frame, "relay closed signaling socket");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                match &err {
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        tracing::debug!(target = "signaling", "signaling websocket closed: {err}");
                    }
                    _ => {
                        tracing::warn!(target = "signaling", "signaling websocket error: {err}");
                    }
                }
                break;
            }
        }
    }
    if let Some(shared) = shared.upgrade() {
        shared.socket_closed(epoch);
    }
}

fn deliver(inbound: &mpsc::UnboundedSender<ServerMessage>, text: &str) {
    match decode_server_message(text) {
        Ok(message) => {
            tracing::trace!(target = "signaling", event = "ws_in", len = text.len());
            let _ = inbound.send(message);
        }
        Err(err) => {
            tracing::warn!(target = "signaling", error = %err, len = text.len(), "ignoring malformed signaling frame");
        }
    }
}

async fn watch_network(shared: Weak<ChannelShared>, mut rx: watch::Receiver<bool>) {
    let mut online = *rx.borrow_and_update();
    while rx.changed().await.is_ok() {
        let now = *rx.borrow_and_update();
        let recovered = now && !online;
        online = now;
        if !recovered {
            continue;
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.identity.lock().is_some() && !shared.is_open() {
            tracing::info!(target = "signaling", "network back online; reconnecting now");
            shared.reconnect.cancel();
            shared.reconnect_now().await;
        }
    }
}

/// The one pending reconnect attempt. Scheduling aborts whatever was pending.
#[derive(Default)]
struct ReconnectTimer {
    pending: Mutex<Option<(u64, JoinHandle<()>)>>,
    tokens: AtomicU64,
}

impl ReconnectTimer {
    fn schedule<F, Fut>(&self, delay: Duration, fire: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // Held across the spawn so even a zero delay finds its own token.
        let mut pending = self.pending.lock();
        let token = self.tokens.fetch_add(1, Ordering::SeqCst) + 1;
        let fire = fire(token);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire.await;
        });
        if let Some((_, previous)) = pending.replace((token, task)) {
            previous.abort();
        }
    }

    /// Claims the pending slot for a firing timer; `false` if it was replaced
    /// or cancelled meanwhile.
    fn take(&self, token: u64) -> bool {
        let mut pending = self.pending.lock();
        if pending.as_ref().map(|(current, _)| *current) == Some(token) {
            pending.take();
            true
        } else {
            false
        }
    }

    fn cancel(&self) -> bool {
        match self.pending.lock().take() {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }
}

/// `http` origins map to `ws`, `https` to `wss`; the path is replaced.
pub fn derive_websocket_url(origin: &Url, path: &str) -> Result<Url, CallError> {
    let scheme = match origin.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(CallError::InvalidConfig(format!(
                "unsupported origin scheme {other}"
            )));
        }
    };
    let mut ws = origin.clone();
    ws.set_scheme(scheme)
        .map_err(|_| CallError::InvalidConfig("invalid websocket scheme".into()))?;
    ws.set_path(path);
    ws.set_query(None);
    ws.set_fragment(None);
    Ok(ws)
}
