use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;

use courtside::call::mock::{MockDevices, MockTransportFactory};
use courtside::call::{CallSession, NetworkStatus};
use courtside::config::CallConfig;

const SESSION_ID: &str = "S1";

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

struct Member {
    session: String,
    conn: u64,
    tx: mpsc::UnboundedSender<WsMessage>,
}

/// In-process stand-in for the signaling relay: tracks who joined which
/// session, forwards `signal` envelopes by `receiverId` and announces
/// arrivals and departures.
#[derive(Default)]
struct RelayState {
    members: HashMap<u64, Member>,
    joins: Vec<(u64, String)>,
    signals: Vec<Value>,
    next_conn: u64,
}

#[derive(Clone, Default)]
struct Relay {
    state: Arc<Mutex<RelayState>>,
}

impl Relay {
    fn joins(&self) -> Vec<(u64, String)> {
        self.state.lock().joins.clone()
    }

    fn signals(&self) -> Vec<Value> {
        self.state.lock().signals.clone()
    }

    fn is_member(&self, user: u64) -> bool {
        self.state.lock().members.contains_key(&user)
    }

    /// Closes one member's socket from the server side.
    fn kick(&self, user: u64) {
        if let Some(member) = self.state.lock().members.get(&user) {
            let _ = member.tx.send(WsMessage::Close(None));
        }
    }

    /// Closes every socket from the server side.
    fn kick_all(&self) {
        let state = self.state.lock();
        for member in state.members.values() {
            let _ = member.tx.send(WsMessage::Close(None));
        }
    }
}

fn send_json(tx: &mpsc::UnboundedSender<WsMessage>, value: Value) {
    let _ = tx.send(WsMessage::Text(value.to_string()));
}

async fn ws_handler(ws: WebSocketUpgrade, State(relay): State<Relay>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

async fn handle_socket(socket: WebSocket, relay: Relay) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, WsMessage::Close(_));
            if sender.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let conn = {
        let mut state = relay.state.lock();
        state.next_conn += 1;
        state.next_conn
    };
    let mut joined: Option<(u64, String)> = None;

    while let Some(Ok(message)) = receiver.next().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        match value.get("type").and_then(Value::as_str) {
            Some("join-session") => {
                let (Some(user), Some(session)) = (
                    value.get("userId").and_then(Value::as_u64),
                    value.get("sessionId").and_then(Value::as_str),
                ) else {
                    continue;
                };
                let mut state = relay.state.lock();
                let others: Vec<u64> = state
                    .members
                    .iter()
                    .filter(|(id, member)| **id != user && member.session == session)
                    .map(|(id, _)| *id)
                    .collect();
                for other in &others {
                    send_json(
                        &state.members[other].tx,
                        json!({ "type": "user-joined", "userId": user }),
                    );
                }
                send_json(&tx, json!({ "type": "session-users", "users": others }));
                state.members.insert(
                    user,
                    Member {
                        session: session.to_string(),
                        conn,
                        tx: tx.clone(),
                    },
                );
                state.joins.push((user, session.to_string()));
                joined = Some((user, session.to_string()));
            }
            Some("signal") => {
                let Some((sender_id, _)) = &joined else {
                    continue;
                };
                let mut state = relay.state.lock();
                state.signals.push(value.clone());
                let receiver_id = value.get("receiverId").and_then(Value::as_u64);
                if let Some(target) = receiver_id.and_then(|id| state.members.get(&id)) {
                    send_json(
                        &target.tx,
                        json!({
                            "type": "signal",
                            "userId": sender_id,
                            "signal": value["signal"].clone(),
                        }),
                    );
                }
            }
            _ => {}
        }
    }

    if let Some((user, session)) = joined {
        let mut state = relay.state.lock();
        if state.members.get(&user).is_some_and(|m| m.conn == conn) {
            state.members.remove(&user);
            for member in state.members.values().filter(|m| m.session == session) {
                send_json(&member.tx, json!({ "type": "user-left", "userId": user }));
            }
        }
    }
    send_task.abort();
}

async fn spawn_relay() -> (Relay, SocketAddr) {
    let relay = Relay::default();
    let router = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(relay.clone());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (relay, addr)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

fn config_for(addr: SocketAddr, reconnect_delay: Duration) -> CallConfig {
    CallConfig::new(format!("http://{addr}"))
        .expect("config")
        .with_reconnect_delay(reconnect_delay)
}

fn session_with(
    config: &CallConfig,
    factory: Arc<MockTransportFactory>,
    network: NetworkStatus,
) -> CallSession {
    CallSession::new(config, factory, Arc::new(MockDevices::default()), network)
        .expect("call session")
}

#[test_timeout::tokio_timeout_test(20)]
async fn connect_joins_the_session() {
    init_tracing();
    let (relay, addr) = spawn_relay().await;
    let config = config_for(addr, Duration::from_secs(5));
    let call = session_with(
        &config,
        Arc::new(MockTransportFactory::default()),
        NetworkStatus::default(),
    );

    call.connect(SESSION_ID, 1).await.expect("connect");

    eventually("join-session", || !relay.joins().is_empty()).await;
    assert_eq!(relay.joins(), vec![(1, SESSION_ID.to_string())]);
    assert!(call.is_signaling_open());
    call.close_all().await;
}

#[test_timeout::tokio_timeout_test(20)]
async fn dropped_socket_reconnects_and_rejoins() {
    init_tracing();
    let (relay, addr) = spawn_relay().await;
    let config = config_for(addr, Duration::from_millis(100));
    let call = session_with(
        &config,
        Arc::new(MockTransportFactory::default()),
        NetworkStatus::default(),
    );
    call.connect(SESSION_ID, 1).await.expect("connect");
    eventually("first join", || relay.joins().len() == 1).await;

    relay.kick_all();

    eventually("rejoin", || relay.joins().len() == 2).await;
    assert_eq!(relay.joins()[1], (1, SESSION_ID.to_string()));
    eventually("socket reopened", || call.is_signaling_open()).await;
    assert!(!call.pending_reconnect());
    call.close_all().await;
}

#[test_timeout::tokio_timeout_test(20)]
async fn closing_stops_reconnects() {
    init_tracing();
    let (relay, addr) = spawn_relay().await;
    let config = config_for(addr, Duration::from_millis(200));
    let call = session_with(
        &config,
        Arc::new(MockTransportFactory::default()),
        NetworkStatus::default(),
    );
    call.connect(SESSION_ID, 1).await.expect("connect");
    eventually("first join", || relay.joins().len() == 1).await;

    relay.kick_all();
    eventually("reconnect scheduled", || call.pending_reconnect()).await;
    call.close_all().await;
    assert!(!call.pending_reconnect());

    sleep(Duration::from_millis(500)).await;
    assert_eq!(relay.joins().len(), 1);
    assert!(!call.is_signaling_open());
}

#[test_timeout::tokio_timeout_test(20)]
async fn coming_back_online_reconnects_immediately() {
    init_tracing();
    let (relay, addr) = spawn_relay().await;
    // Long enough that only the network transition can explain a rejoin.
    let config = config_for(addr, Duration::from_secs(60));
    let network = NetworkStatus::new(true);
    let call = session_with(
        &config,
        Arc::new(MockTransportFactory::default()),
        network.clone(),
    );
    call.connect(SESSION_ID, 1).await.expect("connect");
    eventually("first join", || relay.joins().len() == 1).await;

    network.set_online(false);
    relay.kick_all();
    eventually("reconnect scheduled", || call.pending_reconnect()).await;

    network.set_online(true);

    eventually("rejoin after going online", || relay.joins().len() == 2).await;
    eventually("socket reopened", || call.is_signaling_open()).await;
    assert!(!call.pending_reconnect());
    call.close_all().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn two_participants_negotiate_through_the_relay() {
    init_tracing();
    let (relay, addr) = spawn_relay().await;
    let config = config_for(addr, Duration::from_secs(5));

    let first_factory = Arc::new(MockTransportFactory::with_candidates());
    let first = session_with(&config, first_factory.clone(), NetworkStatus::default());
    let second_factory = Arc::new(MockTransportFactory::with_candidates());
    let second = session_with(&config, second_factory.clone(), NetworkStatus::default());

    let departures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&departures);
    let _departures = first.on_user_disconnect(move |user| {
        assert_eq!(*user, 2);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    first.start_local_stream(true, true).await.expect("first media");
    second.start_local_stream(true, true).await.expect("second media");
    first.connect(SESSION_ID, 1).await.expect("first connect");
    eventually("first member", || relay.is_member(1)).await;
    second.connect(SESSION_ID, 2).await.expect("second connect");

    eventually("offerer applied the answer", || {
        first_factory
            .transport(2)
            .and_then(|t| t.remote_description())
            .is_some()
    })
    .await;
    eventually("candidates applied on both sides", || {
        let offerer = first_factory.transport(2);
        let answerer = second_factory.transport(1);
        offerer.is_some_and(|t| t.applied_candidates().len() == 1)
            && answerer.is_some_and(|t| t.applied_candidates().len() == 1)
    })
    .await;

    let offerer = first_factory.transport(2).expect("offerer transport");
    let answerer = second_factory.transport(1).expect("answerer transport");
    assert_eq!(offerer.offers_created(), 1);
    assert_eq!(offerer.answers_created(), 0);
    assert_eq!(answerer.offers_created(), 0);
    assert_eq!(answerer.answers_created(), 1);
    assert_eq!(first_factory.created(), 1);
    assert_eq!(second_factory.created(), 1);

    for signal in relay.signals() {
        assert_eq!(signal["sessionId"], SESSION_ID);
        let sender = signal["userId"].as_u64().expect("sender id");
        let receiver = signal["receiverId"].as_u64().expect("receiver id");
        assert!(
            (sender, receiver) == (1, 2) || (sender, receiver) == (2, 1),
            "unexpected signal route {sender} -> {receiver}"
        );
    }

    second.close_all().await;

    eventually("first side drops the departed peer", || first.peer_count() == 0).await;
    assert_eq!(departures.load(Ordering::SeqCst), 1);
    assert!(offerer.is_closed());
    assert!(answerer.is_closed());
    first.close_all().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn rejoining_participant_renegotiates_the_pair() {
    init_tracing();
    let (relay, addr) = spawn_relay().await;
    let config = config_for(addr, Duration::from_millis(100));

    let first_factory = Arc::new(MockTransportFactory::default());
    let first = session_with(&config, first_factory.clone(), NetworkStatus::default());
    let second_factory = Arc::new(MockTransportFactory::default());
    let second = session_with(&config, second_factory.clone(), NetworkStatus::default());

    first.start_local_stream(true, true).await.expect("first media");
    second.start_local_stream(true, true).await.expect("second media");
    first.connect(SESSION_ID, 1).await.expect("first connect");
    eventually("first member", || relay.is_member(1)).await;
    second.connect(SESSION_ID, 2).await.expect("second connect");
    eventually("initial answer applied", || {
        first_factory
            .transport(2)
            .and_then(|t| t.remote_description())
            .is_some()
    })
    .await;
    let stale = first_factory.transport(2).expect("first transport");

    relay.kick(1);

    eventually("user 1 rejoins", || relay.joins().len() == 3).await;
    eventually("fresh pair negotiated", || {
        let offerer = first_factory.transport(2);
        let answerer = second_factory.transport(1);
        first_factory.created() == 2
            && second_factory.created() == 2
            && offerer.is_some_and(|t| t.remote_description().is_some())
            && answerer.is_some_and(|t| t.remote_description().is_some())
    })
    .await;

    assert!(stale.is_closed());
    assert_eq!(first.peer_count(), 1);
    assert_eq!(second.peer_count(), 1);
    assert_eq!(
        second_factory
            .transport(1)
            .expect("answerer transport")
            .answers_created(),
        1
    );
    first.close_all().await;
    second.close_all().await;
}
