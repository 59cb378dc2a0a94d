//! Connection manager.
//!
//! A [`CollabClient`] owns at most one live connection to the relay server.
//! Public operations never block: `connect` spawns a driver task and
//! intents are queued on an unbounded channel that the driver drains.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──▶ Connected ──drop──▶ Reconnecting ──▶ Connected
//!      ▲                                        │                    │
//!      └──────────────── disconnect ────────────┘                    └──▶ Failed
//! ```
//!
//! Every connection cycle carries a generation number. `disconnect` (or a
//! new `connect` after a terminal failure) bumps it, and a driver that finds
//! its generation stale stops without touching shared state.

use serde_json::{json, Value};
use skystage_protocol::events::{is_local, Ping};
use skystage_protocol::{names, Frame, Intent};
use skystage_transport::{
    handshake, ConnectRequest, Connection, ConnectionId, Connector, Handshake, TransportError,
};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::backoff::ReconnectPolicy;
use crate::config::RelayConfig;
use crate::dispatcher::{EventDispatcher, ListenerId, Subscription};
use crate::heartbeat::now_millis;
use crate::session::{JoinOutcome, RoomMembership, SessionState};
use crate::token::TokenStore;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection and no connection attempt in progress.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Handshake complete; intents are forwarded.
    Connected,
    /// Waiting for or performing a reconnect attempt.
    Reconnecting,
    /// Reconnect budget exhausted. Terminal until the next `connect`.
    Failed,
}

impl ConnectionState {
    /// Whether a connection cycle is running.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }

    /// Lowercase name, as used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client options.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Relay server URL.
    pub url: String,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Budget for opening the transport and completing the handshake.
    pub handshake_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for ClientOptions {
    fn from(config: &RelayConfig) -> Self {
        Self {
            url: config.ws_url.clone(),
            reconnect: config.reconnect_policy(),
            heartbeat_interval: config.heartbeat_interval(),
            handshake_timeout: config.handshake_timeout(),
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: ConnectionState,
    generation: u64,
    user_id: Option<String>,
    connection_id: Option<ConnectionId>,
    session: SessionState,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    shutdown: Option<watch::Sender<bool>>,
    attempts: u32,
}

impl Shared {
    /// Queue a frame if the connection is live.
    fn send(&self, frame: Frame) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        match &self.outbound {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn send_intent<I: Intent>(&self, intent: &I) -> bool {
        match Frame::intent(intent) {
            Ok(frame) => self.send(frame),
            Err(e) => {
                warn!(event = I::EVENT, error = %e, "Failed to encode intent");
                false
            }
        }
    }

    fn stop_driver(&mut self) {
        self.generation += 1;
        self.outbound = None;
        self.connection_id = None;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
    }
}

struct Inner {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenStore>,
    dispatcher: EventDispatcher,
    shared: Mutex<Shared>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }
}

/// Handle to the collaboration relay.
///
/// Cloning is cheap; clones share the connection, room membership and
/// dispatcher. The background driver keeps running until [`disconnect`]
/// (or [`dispose`]) is called or the reconnect budget is spent, even if
/// every handle has been dropped.
///
/// [`disconnect`]: Self::disconnect
/// [`dispose`]: Self::dispose
#[derive(Clone)]
pub struct CollabClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for CollabClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.lock();
        f.debug_struct("CollabClient")
            .field("url", &self.inner.options.url)
            .field("connector", &self.inner.connector.name())
            .field("state", &shared.state)
            .field("room", &shared.session.current().map(|m| &m.room_id))
            .finish()
    }
}

impl CollabClient {
    /// Create a client. Nothing is opened until [`connect`](Self::connect).
    #[must_use]
    pub fn new(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                connector,
                tokens,
                dispatcher: EventDispatcher::new(),
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    user_id: None,
                    connection_id: None,
                    session: SessionState::new(),
                    outbound: None,
                    shutdown: None,
                    attempts: 0,
                }),
            }),
        }
    }

    /// Create a WebSocket client from configuration.
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            ClientOptions::from(config),
            Arc::new(skystage_transport::WebSocketConnector::default()),
            config.token_store(),
        )
    }

    /// Start connecting as `user_id`.
    ///
    /// Returns `false` without doing anything if a connection cycle is
    /// already running. After a terminal failure this starts a fresh cycle
    /// and re-joins the room that was joined before the failure.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn connect(&self, user_id: impl Into<String>) -> bool {
        let user_id = user_id.into();

        let (generation, shutdown_rx) = {
            let mut shared = self.inner.lock();
            if shared.state.is_active() {
                debug!(state = %shared.state, "Connect ignored, connection already active");
                return false;
            }

            shared.generation += 1;
            shared.state = ConnectionState::Connecting;
            shared.attempts = 0;

            let stale_room = shared
                .session
                .current()
                .filter(|m| m.user_id != user_id)
                .map(|m| m.room_id.clone());
            if let Some(room_id) = stale_room {
                shared.session.join(room_id, user_id.clone());
            }
            shared.user_id = Some(user_id.clone());

            let (tx, rx) = watch::channel(false);
            shared.shutdown = Some(tx);
            (shared.generation, rx)
        };

        info!(user = %user_id, url = %self.inner.options.url, "Connecting to relay");
        tokio::spawn(drive(
            Arc::clone(&self.inner),
            generation,
            user_id,
            shutdown_rx,
        ));
        true
    }

    /// Close the connection and forget the joined room.
    ///
    /// Stops the heartbeat and any pending reconnect. Safe to call when not
    /// connected.
    pub fn disconnect(&self) {
        let was_active = {
            let mut shared = self.inner.lock();
            let was_active = shared.state.is_active();
            shared.stop_driver();
            shared.state = ConnectionState::Disconnected;
            shared.attempts = 0;
            shared.session.leave();
            was_active
        };

        if was_active {
            info!("Disconnected from relay");
            self.inner
                .dispatcher
                .dispatch(names::DISCONNECTED, &json!({ "reason": "client" }));
        }
    }

    /// Disconnect and drop every dispatcher subscription.
    pub fn dispose(&self) {
        self.disconnect();
        self.inner.dispatcher.clear();
    }

    /// Send a raw event.
    ///
    /// Returns `true` if the event was queued to a live connection. Names
    /// reserved for local notifications are refused.
    pub fn emit(&self, event: &str, data: Value) -> bool {
        if is_local(event) {
            warn!(event = %event, "Refusing to emit a local event name");
            return false;
        }
        self.inner.lock().send(Frame::event(event, data))
    }

    /// Send a typed intent. Returns `true` if it was queued.
    pub fn emit_intent<I: Intent>(&self, intent: &I) -> bool {
        self.inner.lock().send_intent(intent)
    }

    /// Join a show room, leaving the current one if it differs.
    ///
    /// The membership is recorded even while the connection is not yet
    /// live; the join is then sent as soon as it is. Returns `true` if a
    /// join was sent now. Does nothing before the first `connect`, since
    /// there is no user to join as.
    pub fn join_show(&self, room_id: impl Into<String>) -> bool {
        let room_id = room_id.into();
        let mut shared = self.inner.lock();

        let Some(user_id) = shared.user_id.clone() else {
            warn!(room = %room_id, "Cannot join a show before connecting");
            return false;
        };

        match shared.session.join(room_id.clone(), user_id) {
            JoinOutcome::Unchanged => false,
            JoinOutcome::Joined { left } => {
                if let Some(prev) = left {
                    shared.send_intent(&prev.leave_intent());
                }
                let sent = shared
                    .session
                    .current()
                    .map(RoomMembership::join_intent)
                    .is_some_and(|join| shared.send_intent(&join));
                if sent {
                    info!(room = %room_id, "Joined show room");
                } else {
                    debug!(room = %room_id, "Show room recorded, join deferred until connected");
                }
                sent
            }
        }
    }

    /// Leave the current show room. Returns `true` if a leave was sent.
    pub fn leave_show(&self) -> bool {
        let mut shared = self.inner.lock();
        match shared.session.leave() {
            Some(membership) => {
                info!(room = %membership.room_id, "Left show room");
                shared.send_intent(&membership.leave_intent())
            }
            None => false,
        }
    }

    /// Room currently joined (or waiting to be joined).
    #[must_use]
    pub fn current_room(&self) -> Option<String> {
        self.current_membership().map(|m| m.room_id)
    }

    /// Current room membership.
    #[must_use]
    pub fn current_membership(&self) -> Option<RoomMembership> {
        self.inner.lock().session.current().cloned()
    }

    /// Register a callback for an event. See [`EventDispatcher::on`].
    pub fn on<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on(event, callback)
    }

    /// Remove a callback by identity. See [`EventDispatcher::off`].
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.dispatcher.off(event, id)
    }

    /// The dispatcher events are delivered through.
    #[must_use]
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Whether intents are currently forwarded.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// User of the most recent `connect`.
    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        self.inner.lock().user_id.clone()
    }

    /// Reconnect attempts made since the connection was last live.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    /// Server-assigned ID of the live connection.
    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.lock().connection_id.clone()
    }
}

/// Why a live connection ended.
enum Ended {
    Shutdown,
    Dropped(String),
}

/// Why opening a connection did not succeed.
enum OpenError {
    Shutdown,
    Transport(TransportError),
}

/// Connection cycle for one generation: open, run, back off, repeat.
async fn drive(
    inner: Arc<Inner>,
    generation: u64,
    user_id: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let policy = inner.options.reconnect;
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            if !policy.allows(attempt) {
                give_up(&inner, generation, attempt - 1);
                return;
            }

            let delay = policy.delay(attempt);
            {
                let mut shared = inner.lock();
                if shared.generation != generation {
                    return;
                }
                shared.state = ConnectionState::Reconnecting;
                shared.attempts = attempt;
            }

            info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            inner.dispatcher.dispatch(
                names::RECONNECTING,
                &json!({ "attempt": attempt, "delayMs": delay.as_millis() as u64 }),
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }

        let (conn, handshake) = match open(&inner, &user_id, &mut shutdown).await {
            Ok(opened) => opened,
            Err(OpenError::Shutdown) => return,
            Err(OpenError::Transport(e)) => {
                if !inner.is_current(generation) {
                    return;
                }
                warn!(attempt, error = %e, "Connection attempt failed");
                inner
                    .dispatcher
                    .dispatch(names::ERROR, &json!({ "message": e.to_string() }));
                attempt += 1;
                continue;
            }
        };

        match run_connection(&inner, generation, conn, handshake, &mut shutdown).await {
            Ended::Shutdown => return,
            Ended::Dropped(reason) => {
                {
                    let mut shared = inner.lock();
                    if shared.generation != generation {
                        return;
                    }
                    shared.state = ConnectionState::Disconnected;
                    shared.outbound = None;
                    shared.connection_id = None;
                }
                warn!(reason = %reason, "Connection lost");
                inner
                    .dispatcher
                    .dispatch(names::DISCONNECTED, &json!({ "reason": reason }));
                attempt = 1;
            }
        }
    }
}

async fn open(
    inner: &Inner,
    user_id: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(Box<dyn Connection>, Handshake), OpenError> {
    let request =
        ConnectRequest::new(inner.options.url.clone(), user_id).with_token(inner.tokens.token());
    let timeout = inner.options.handshake_timeout;

    let attempt = async {
        let mut conn = tokio::time::timeout(timeout, inner.connector.connect(&request))
            .await
            .map_err(|_| TransportError::Timeout)??;

        match handshake(conn.as_mut(), &request, timeout).await {
            Ok(handshake) => Ok((conn, handshake)),
            Err(e) => {
                let _ = conn.close().await;
                Err(e)
            }
        }
    };

    tokio::select! {
        result = attempt => result.map_err(OpenError::Transport),
        _ = shutdown.changed() => Err(OpenError::Shutdown),
    }
}

async fn run_connection(
    inner: &Inner,
    generation: u64,
    mut conn: Box<dyn Connection>,
    handshake: Handshake,
    shutdown: &mut watch::Receiver<bool>,
) -> Ended {
    let (tx, mut outbound) = mpsc::unbounded_channel();

    // Install the sender and queue the re-join under one lock so a
    // concurrent join_show cannot send a second join.
    let rejoined = {
        let mut shared = inner.lock();
        if shared.generation != generation {
            None
        } else {
            shared.state = ConnectionState::Connected;
            shared.attempts = 0;
            shared.connection_id = Some(handshake.connection_id.clone());
            shared.outbound = Some(tx);
            Some(match shared.session.rejoin_intent() {
                Some(join) => shared.send_intent(&join).then_some(join.room_id),
                None => None,
            })
        }
    };

    let Some(rejoined) = rejoined else {
        let _ = conn.close().await;
        return Ended::Shutdown;
    };

    info!(connection = %handshake.connection_id, "Connected to relay");
    if let Some(room) = rejoined {
        info!(room = %room, "Rejoining show room");
    }
    inner.dispatcher.dispatch(
        names::CONNECTED,
        &json!({ "connectionId": handshake.connection_id.as_str() }),
    );

    let period = heartbeat_period(inner.options.heartbeat_interval, handshake.heartbeat);
    debug!(period_ms = period.as_millis() as u64, "Heartbeat period");
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ended = loop {
        tokio::select! {
            _ = shutdown.changed() => break Ended::Shutdown,

            Some(frame) = outbound.recv() => {
                trace!(event = ?frame.event_name(), "Sending frame");
                if let Err(e) = conn.send(frame).await {
                    break Ended::Dropped(e.to_string());
                }
            }

            _ = heartbeat.tick() => {
                let timestamp = now_millis();
                let ping = match Frame::intent(&Ping { timestamp }) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(error = %e, "Failed to encode ping");
                        continue;
                    }
                };
                if let Err(e) = conn.send(ping).await {
                    break Ended::Dropped(e.to_string());
                }
                trace!(timestamp, "Heartbeat sent");
                inner
                    .dispatcher
                    .dispatch(names::HEARTBEAT, &json!({ "timestamp": timestamp }));
            }

            result = conn.recv() => match result {
                Ok(Some(frame)) => handle_inbound(inner, frame),
                Ok(None) => break Ended::Dropped("closed by server".to_string()),
                Err(e) => break Ended::Dropped(e.to_string()),
            },
        }
    };

    let _ = conn.close().await;
    ended
}

/// The configured heartbeat period, shortened to the server's interval when
/// the server asks for more frequent pings.
fn heartbeat_period(configured: Duration, server: Option<Duration>) -> Duration {
    match server {
        Some(hint) if !hint.is_zero() => configured.min(hint),
        _ => configured,
    }
}

fn handle_inbound(inner: &Inner, frame: Frame) {
    match frame {
        Frame::Event { event, data } => {
            if is_local(&event) {
                warn!(event = %event, "Ignoring server event with a local name");
                return;
            }
            trace!(event = %event, "Event received");
            inner.dispatcher.dispatch(&event, &data);
        }
        Frame::Error { code, message } => {
            warn!(code, message = %message, "Server reported an error");
            inner.dispatcher.dispatch(
                names::ERROR,
                &json!({ "code": code, "message": message }),
            );
        }
        other => debug!(kind = ?other.kind(), "Ignoring unexpected frame"),
    }
}

fn give_up(inner: &Inner, generation: u64, attempts: u32) {
    {
        let mut shared = inner.lock();
        if shared.generation != generation {
            return;
        }
        shared.state = ConnectionState::Failed;
        shared.attempts = attempts;
        shared.outbound = None;
        shared.connection_id = None;
        shared.shutdown = None;
    }

    error!(attempts, "Reconnect attempts exhausted");
    inner
        .dispatcher
        .dispatch(names::RECONNECT_FAILED, &json!({ "attempts": attempts }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::MemoryTokenStore;
    use skystage_transport::memory::{self, MemoryPeer, MemoryServer};

    fn client(base_ms: u64, max_attempts: u32) -> (CollabClient, MemoryServer) {
        let (connector, server) = memory::pair();
        let options = ClientOptions {
            url: "memory://relay".into(),
            reconnect: ReconnectPolicy::new(Duration::from_millis(base_ms), max_attempts),
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
        };
        let client = CollabClient::new(
            options,
            Arc::new(connector),
            Arc::new(MemoryTokenStore::new(Some("secret".into()))),
        );
        (client, server)
    }

    fn events(
        client: &CollabClient,
        event: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = client.on(event, move |data| {
            let _ = tx.send(data.clone());
        });
        (sub, rx)
    }

    async fn accept(server: &mut MemoryServer, id: &str) -> MemoryPeer {
        let mut peer = server.accept().await.unwrap();
        peer.accept_handshake(id, 30_000).await.unwrap();
        peer
    }

    fn assert_join(frame: Frame, room: &str) {
        match frame {
            Frame::Event { event, data } => {
                assert_eq!(event, names::SHOW_JOIN);
                assert_eq!(data["roomId"], room);
                assert_eq!(data["userId"], "user-1");
            }
            other => panic!("Expected show:join, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_show_sends_exactly_one_join() {
        let (client, mut server) = client(100, 3);
        let (_sub, mut connected) = events(&client, names::CONNECTED);

        assert!(client.connect("user-1"));
        let mut peer = server.accept().await.unwrap();
        let hello = peer.accept_handshake("conn-1", 30_000).await.unwrap();
        match hello {
            Frame::Connect { user_id, token, .. } => {
                assert_eq!(user_id, "user-1");
                assert_eq!(token.as_deref(), Some("secret"));
            }
            other => panic!("Expected connect frame, got {:?}", other),
        }

        let data = connected.recv().await.unwrap();
        assert_eq!(data["connectionId"], "conn-1");
        assert!(client.is_connected());
        assert_eq!(client.connection_id().unwrap().as_str(), "conn-1");

        assert!(client.join_show("show-42"));
        assert_join(peer.recv().await.unwrap(), "show-42");

        // Same room again is a no-op.
        assert!(!client.join_show("show-42"));
        tokio::task::yield_now().await;
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_rejoins_room_once() {
        let (client, mut server) = client(100, 3);
        let (_c, mut connected) = events(&client, names::CONNECTED);
        let (_d, mut disconnected) = events(&client, names::DISCONNECTED);
        let (_r, mut reconnecting) = events(&client, names::RECONNECTING);

        client.connect("user-1");
        let mut peer = accept(&mut server, "conn-1").await;
        connected.recv().await.unwrap();
        client.join_show("show-42");
        assert_join(peer.recv().await.unwrap(), "show-42");

        // Server drops the connection.
        drop(peer);
        let mut peer = accept(&mut server, "conn-2").await;
        connected.recv().await.unwrap();

        assert_join(peer.recv().await.unwrap(), "show-42");
        tokio::task::yield_now().await;
        assert!(peer.try_recv().is_none());

        assert_eq!(disconnected.recv().await.unwrap()["reason"], "closed by server");
        let retry = reconnecting.recv().await.unwrap();
        assert_eq!(retry["attempt"], 1);
        assert_eq!(retry["delayMs"], 100);
        assert_eq!(client.reconnect_attempts(), 0);
        assert_eq!(client.current_room().as_deref(), Some("show-42"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_then_failed() {
        let (client, mut server) = client(100, 3);
        let (_r, mut reconnecting) = events(&client, names::RECONNECTING);
        let (_f, mut failed) = events(&client, names::RECONNECT_FAILED);
        server.set_refusing(true);

        let start = Instant::now();
        client.connect("user-1");
        let data = failed.recv().await.unwrap();
        assert_eq!(data["attempts"], 3);

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(700), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(800), "{elapsed:?}");

        let mut delays = Vec::new();
        while let Ok(retry) = reconnecting.try_recv() {
            delays.push(retry["delayMs"].as_u64().unwrap());
        }
        assert_eq!(delays, vec![100, 200, 400]);

        // One initial attempt plus three retries, then nothing more.
        assert_eq!(server.attempts(), 4);
        assert_eq!(client.state(), ConnectionState::Failed);
        assert_eq!(client.reconnect_attempts(), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(server.attempts(), 4);
        assert!(server.try_accept().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_after_failure_restores_room() {
        let (client, mut server) = client(50, 2);
        let (_c, mut connected) = events(&client, names::CONNECTED);
        let (_f, mut failed) = events(&client, names::RECONNECT_FAILED);

        client.connect("user-1");
        let mut peer = accept(&mut server, "conn-1").await;
        connected.recv().await.unwrap();
        client.join_show("show-42");
        assert_join(peer.recv().await.unwrap(), "show-42");

        server.set_refusing(true);
        drop(peer);
        failed.recv().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Failed);
        assert_eq!(client.current_room().as_deref(), Some("show-42"));

        server.set_refusing(false);
        assert!(client.connect("user-1"));
        let mut peer = accept(&mut server, "conn-2").await;
        connected.recv().await.unwrap();
        assert_join(peer.recv().await.unwrap(), "show-42");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_clears_room() {
        let (client, mut server) = client(100, 3);
        let (_c, mut connected) = events(&client, names::CONNECTED);
        let (_d, mut disconnected) = events(&client, names::DISCONNECTED);

        client.connect("user-1");
        let mut peer = accept(&mut server, "conn-1").await;
        connected.recv().await.unwrap();
        client.join_show("show-42");
        assert_join(peer.recv().await.unwrap(), "show-42");

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.current_room().is_none());
        assert!(client.connection_id().is_none());
        assert_eq!(disconnected.recv().await.unwrap()["reason"], "client");

        // The driver closes the transport; no leave is sent.
        assert!(peer.recv().await.is_none());

        // Safe when already disconnected, and silent.
        client.disconnect();
        assert!(disconnected.try_recv().is_err());

        client.connect("user-1");
        let mut peer = accept(&mut server, "conn-2").await;
        connected.recv().await.unwrap();
        tokio::task::yield_now().await;
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let (client, mut server) = client(100, 3);

        assert!(client.connect("user-1"));
        assert!(!client.connect("user-1"));
        assert_eq!(client.state(), ConnectionState::Connecting);

        let _peer = accept(&mut server, "conn-1").await;
        tokio::task::yield_now().await;
        assert!(server.try_accept().is_none());
        assert_eq!(server.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intents_are_noops_until_live() {
        let (client, mut server) = client(100, 3);
        let (_c, mut connected) = events(&client, names::CONNECTED);

        assert!(!client.emit(names::CURSOR_MOVE, json!({ "x": 1 })));
        assert!(!client.join_show("show-42"));
        assert!(client.current_room().is_none());

        client.connect("user-1");
        assert!(!client.emit(names::CURSOR_MOVE, json!({ "x": 1 })));
        // Recorded now, sent once live.
        assert!(!client.join_show("show-42"));
        assert_eq!(client.current_room().as_deref(), Some("show-42"));

        let mut peer = accept(&mut server, "conn-1").await;
        connected.recv().await.unwrap();
        assert_join(peer.recv().await.unwrap(), "show-42");
        tokio::task::yield_now().await;
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_rooms_leaves_previous() {
        let (client, mut server) = client(100, 3);
        let (_c, mut connected) = events(&client, names::CONNECTED);

        client.connect("user-1");
        let mut peer = accept(&mut server, "conn-1").await;
        connected.recv().await.unwrap();

        client.join_show("show-1");
        assert_join(peer.recv().await.unwrap(), "show-1");

        client.join_show("show-2");
        let leave = peer.recv().await.unwrap();
        assert_eq!(leave.event_name(), Some(names::SHOW_LEAVE));
        assert_join(peer.recv().await.unwrap(), "show-2");

        assert!(client.leave_show());
        let leave = peer.recv().await.unwrap();
        assert_eq!(leave.event_name(), Some(names::SHOW_LEAVE));
        assert!(!client.leave_show());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_and_inbound_events() {
        let (client, mut server) = client(100, 3);
        let (_c, mut connected) = events(&client, names::CONNECTED);
        let (_h, mut heartbeats) = events(&client, names::HEARTBEAT);
        let (_p, mut pongs) = events(&client, names::PONG);
        let (_e, mut errors) = events(&client, names::ERROR);
        let (_l, mut local) = events(&client, names::RECONNECT_FAILED);

        client.connect("user-1");
        let mut peer = accept(&mut server, "conn-1").await;
        connected.recv().await.unwrap();

        // Time auto-advances to the first heartbeat.
        let ping = peer.recv().await.unwrap();
        let timestamp = match ping {
            Frame::Event { event, data } => {
                assert_eq!(event, names::PING);
                data["timestamp"].as_u64().unwrap()
            }
            other => panic!("Expected ping, got {:?}", other),
        };
        assert_eq!(heartbeats.recv().await.unwrap()["timestamp"], timestamp);

        peer.send(Frame::event(names::PONG, json!({ "timestamp": timestamp })));
        assert_eq!(pongs.recv().await.unwrap()["timestamp"], timestamp);

        peer.send(Frame::error(1004, "not in a room"));
        let err = errors.recv().await.unwrap();
        assert_eq!(err["code"], 1004);
        assert_eq!(err["message"], "not in a room");

        // Servers cannot forge local notifications.
        peer.send(Frame::event(names::RECONNECT_FAILED, json!({})));
        peer.send(Frame::event(names::PONG, json!({ "timestamp": 1 })));
        pongs.recv().await.unwrap();
        assert!(local.try_recv().is_err());
    }

    #[test]
    fn test_heartbeat_period_follows_shorter_server_interval() {
        let configured = Duration::from_secs(120);
        let server = Some(Duration::from_secs(30));
        assert_eq!(heartbeat_period(configured, server), Duration::from_secs(30));
        assert_eq!(heartbeat_period(Duration::from_secs(10), server), Duration::from_secs(10));
        assert_eq!(heartbeat_period(configured, None), configured);
        assert_eq!(heartbeat_period(configured, Some(Duration::ZERO)), configured);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_uses_server_interval_when_shorter() {
        let (client, mut server) = client(100, 3);
        let (_c, mut connected) = events(&client, names::CONNECTED);

        client.connect("user-1");
        let mut peer = server.accept().await.unwrap();
        peer.accept_handshake("conn-1", 1_000).await.unwrap();
        connected.recv().await.unwrap();

        let start = Instant::now();
        let ping = peer.recv().await.unwrap();
        assert_eq!(ping.event_name(), Some(names::PING));
        assert!(start.elapsed() <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_refuses_local_names() {
        let (client, mut server) = client(100, 3);
        let (_c, mut connected) = events(&client, names::CONNECTED);

        client.connect("user-1");
        let mut peer = accept(&mut server, "conn-1").await;
        connected.recv().await.unwrap();

        assert!(!client.emit(names::CONNECTED, json!({})));
        assert!(client.emit("custom:event", json!({ "n": 1 })));
        let frame = peer.recv().await.unwrap();
        assert_eq!(frame.event_name(), Some("custom:event"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_handshake_surfaces_error() {
        let (client, mut server) = client(100, 1);
        let (_e, mut errors) = events(&client, names::ERROR);
        let (_f, mut failed) = events(&client, names::RECONNECT_FAILED);

        client.connect("user-1");
        let mut peer = server.accept().await.unwrap();
        peer.recv().await.unwrap();
        peer.send(Frame::error(1002, "bad token"));

        let err = errors.recv().await.unwrap();
        assert!(err["message"].as_str().unwrap().contains("bad token"));

        drop(peer);
        server.set_refusing(true);
        failed.recv().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_drops_subscriptions() {
        let (client, _server) = client(100, 3);
        let sub = client.on(names::CONNECTED, |_| {});
        sub.detach();
        assert_eq!(client.dispatcher().listener_count(names::CONNECTED), 1);

        client.connect("user-1");
        client.dispose();
        assert_eq!(client.dispatcher().listener_count(names::CONNECTED), 0);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
