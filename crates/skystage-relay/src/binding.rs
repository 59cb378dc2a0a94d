//! Editor binding.
//!
//! A [`ShowBinding`] ties a set of event handlers, a connection and a show
//! room to the lifetime of one editor view. Activating it connects, registers
//! the handlers and joins the room; dropping it unregisters every handler it
//! registered and disconnects.

use serde::Deserialize;
use serde_json::{json, Value};
use skystage_protocol::events::{
    CursorMove, CursorPosition, FormationAdd, FormationMove, FormationRemove, PlaybackSync,
    Pong, PreviewStart, PreviewStop, SelectionChange, ShowUpdate,
};
use skystage_protocol::{names, Intent};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

use crate::client::{CollabClient, ConnectionState};
use crate::dispatcher::{Callback, Subscription};
use crate::heartbeat::{now_millis, LatencyTracker};
use crate::session::RoomMembership;

/// What a binding does when activated.
#[derive(Default)]
pub struct BindingOptions {
    user_id: Option<String>,
    room_id: Option<String>,
    handlers: Vec<(String, Callback)>,
}

impl fmt::Debug for BindingOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingOptions")
            .field("user_id", &self.user_id)
            .field("room_id", &self.room_id)
            .field(
                "handlers",
                &self.handlers.iter().map(|(e, _)| e).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl BindingOptions {
    /// Options that register nothing and connect nowhere.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect as this user on activation.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Join this show room on activation.
    #[must_use]
    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    /// Register a handler for the binding's lifetime.
    #[must_use]
    pub fn on<F>(mut self, event: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.handlers.push((event.into(), Arc::new(callback)));
        self
    }
}

fn lock(tracker: &Mutex<LatencyTracker>) -> MutexGuard<'_, LatencyTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scoped connection, subscriptions and room for one editor view.
pub struct ShowBinding {
    client: CollabClient,
    subscriptions: Vec<Subscription>,
    latency: Arc<Mutex<LatencyTracker>>,
    active: bool,
}

impl fmt::Debug for ShowBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShowBinding")
            .field("client", &self.client)
            .field("subscriptions", &self.subscriptions.len())
            .field("active", &self.active)
            .finish()
    }
}

impl ShowBinding {
    /// Register the handlers, connect and join the room.
    ///
    /// The room is joined immediately if the connection is live, otherwise
    /// as soon as it becomes live.
    pub fn activate(client: &CollabClient, options: BindingOptions) -> Self {
        let dispatcher = client.dispatcher();
        let latency = Arc::new(Mutex::new(LatencyTracker::new()));

        let mut subscriptions: Vec<Subscription> = options
            .handlers
            .into_iter()
            .map(|(event, callback)| dispatcher.on_callback(event, callback))
            .collect();

        let tracker = Arc::clone(&latency);
        subscriptions.push(dispatcher.on(names::HEARTBEAT, move |data| {
            if let Some(timestamp) = data["timestamp"].as_u64() {
                lock(&tracker).record_ping(timestamp);
            }
        }));

        let tracker = Arc::clone(&latency);
        let notify = dispatcher.clone();
        subscriptions.push(dispatcher.on(names::PONG, move |data| {
            let Ok(pong) = Pong::deserialize(data) else {
                return;
            };
            let rtt = lock(&tracker).record_pong(pong.timestamp);
            if let Some(rtt) = rtt {
                trace!(latency_ms = rtt.as_millis() as u64, "Latency measured");
                notify.dispatch(
                    names::LATENCY,
                    &json!({ "latencyMs": rtt.as_millis() as u64 }),
                );
            }
        }));

        let tracker = Arc::clone(&latency);
        subscriptions.push(dispatcher.on(names::DISCONNECTED, move |_| {
            lock(&tracker).reset();
        }));

        if let Some(user_id) = options.user_id {
            client.connect(user_id);
        }
        if let Some(room_id) = options.room_id {
            client.join_show(room_id);
        }

        debug!(subscriptions = subscriptions.len(), "Show binding activated");

        Self {
            client: client.clone(),
            subscriptions,
            latency,
            active: true,
        }
    }

    /// Unregister every handler and disconnect. Dropping does the same.
    pub fn deactivate(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.client.disconnect();
        debug!("Show binding deactivated");
    }

    /// The client this binding drives.
    #[must_use]
    pub fn client(&self) -> &CollabClient {
        &self.client
    }

    /// Most recent heartbeat round-trip time.
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        lock(&self.latency).latency()
    }

    /// Whether intents are currently forwarded.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    /// Join a show room. See [`CollabClient::join_show`].
    pub fn join_show(&self, room_id: impl Into<String>) -> bool {
        self.client.join_show(room_id)
    }

    /// Leave the current show room.
    pub fn leave_show(&self) -> bool {
        self.client.leave_show()
    }

    /// Send an intent scoped to the current room. No-op when the connection
    /// is not live or no room is joined.
    fn send_in_room<I, F>(&self, build: F) -> bool
    where
        I: Intent,
        F: FnOnce(RoomMembership) -> I,
    {
        if !self.client.is_connected() {
            return false;
        }
        match self.client.current_membership() {
            Some(membership) => self.client.emit_intent(&build(membership)),
            None => false,
        }
    }

    /// Broadcast a change to the show document.
    pub fn send_update(&self, updates: Value) -> bool {
        self.send_in_room(|m| ShowUpdate {
            room_id: m.room_id,
            user_id: m.user_id,
            updates,
            timestamp: now_millis(),
        })
    }

    /// Broadcast a formation placed on the timeline.
    pub fn add_formation(&self, formation: Value) -> bool {
        self.send_in_room(|m| FormationAdd {
            room_id: m.room_id,
            user_id: m.user_id,
            formation,
        })
    }

    /// Broadcast a formation removed from the timeline.
    pub fn remove_formation(&self, formation_id: impl Into<String>) -> bool {
        self.send_in_room(|m| FormationRemove {
            room_id: m.room_id,
            user_id: m.user_id,
            formation_id: formation_id.into(),
        })
    }

    /// Broadcast a formation moved to `start_time` seconds.
    pub fn move_formation(&self, formation_id: impl Into<String>, start_time: f64) -> bool {
        self.send_in_room(|m| FormationMove {
            room_id: m.room_id,
            user_id: m.user_id,
            formation_id: formation_id.into(),
            start_time,
        })
    }

    /// Share the playback position.
    pub fn sync_playback(&self, is_playing: bool, current_time: f64) -> bool {
        self.send_in_room(|m| PlaybackSync {
            room_id: m.room_id,
            user_id: m.user_id,
            is_playing,
            current_time,
        })
    }

    /// Share the local cursor position.
    pub fn update_cursor(&self, x: f64, y: f64) -> bool {
        self.send_in_room(|m| CursorMove {
            room_id: m.room_id,
            user_id: m.user_id,
            position: CursorPosition { x, y },
        })
    }

    /// Share the local selection.
    pub fn update_selection(&self, selected_ids: Vec<String>) -> bool {
        self.send_in_room(|m| SelectionChange {
            room_id: m.room_id,
            user_id: m.user_id,
            selected_ids,
        })
    }

    /// Start streaming the 3D preview to the room.
    pub fn start_live_preview(&self) -> bool {
        self.send_in_room(|m| PreviewStart {
            room_id: m.room_id,
            user_id: m.user_id,
        })
    }

    /// Stop streaming the 3D preview.
    pub fn stop_live_preview(&self) -> bool {
        self.send_in_room(|m| PreviewStop {
            room_id: m.room_id,
            user_id: m.user_id,
        })
    }
}

impl Drop for ShowBinding {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ReconnectPolicy;
    use crate::client::ClientOptions;
    use crate::token::MemoryTokenStore;
    use skystage_protocol::Frame;
    use skystage_transport::memory::{self, MemoryPeer, MemoryServer};
    use tokio::sync::mpsc;

    fn client() -> (CollabClient, MemoryServer) {
        let (connector, server) = memory::pair();
        let options = ClientOptions {
            url: "memory://relay".into(),
            reconnect: ReconnectPolicy::new(Duration::from_millis(100), 3),
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
        };
        let client = CollabClient::new(
            options,
            Arc::new(connector),
            Arc::new(MemoryTokenStore::default()),
        );
        (client, server)
    }

    async fn accept(server: &mut MemoryServer, id: &str) -> MemoryPeer {
        let mut peer = server.accept().await.unwrap();
        peer.accept_handshake(id, 30_000).await.unwrap();
        peer
    }

    fn channel() -> (
        mpsc::UnboundedSender<Value>,
        mpsc::UnboundedReceiver<Value>,
    ) {
        mpsc::unbounded_channel()
    }

    fn expect_event(frame: Frame, name: &str) -> Value {
        match frame {
            Frame::Event { event, data } => {
                assert_eq!(event, name);
                data
            }
            other => panic!("Expected {}, got {:?}", name, other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_connects_registers_and_joins() {
        let (client, mut server) = client();
        let (connected_tx, mut connected) = channel();
        let (cursor_tx, mut cursors) = channel();

        let binding = ShowBinding::activate(
            &client,
            BindingOptions::new()
                .with_user("user-1")
                .with_room("show-42")
                .on(names::CONNECTED, move |d| {
                    let _ = connected_tx.send(d.clone());
                })
                .on(names::CURSOR_MOVED, move |d| {
                    let _ = cursor_tx.send(d.clone());
                }),
        );

        let mut peer = accept(&mut server, "conn-1").await;
        connected.recv().await.unwrap();
        assert!(binding.is_connected());

        let join = expect_event(peer.recv().await.unwrap(), names::SHOW_JOIN);
        assert_eq!(join["roomId"], "show-42");
        assert_eq!(join["userId"], "user-1");

        peer.send(Frame::event(
            names::CURSOR_MOVED,
            json!({ "roomId": "show-42", "userId": "user-2", "position": { "x": 1.0, "y": 2.0 } }),
        ));
        let moved = cursors.recv().await.unwrap();
        assert_eq!(moved["userId"], "user-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivation_releases_everything() {
        let (client, mut server) = client();
        let (tx, mut connected) = channel();

        let binding = ShowBinding::activate(
            &client,
            BindingOptions::new()
                .with_user("user-1")
                .with_room("show-42")
                .on(names::CONNECTED, move |d| {
                    let _ = tx.send(d.clone());
                }),
        );
        let mut peer = accept(&mut server, "conn-1").await;
        connected.recv().await.unwrap();
        assert!(client.dispatcher().listener_count(names::PONG) > 0);

        binding.deactivate();

        assert!(client.dispatcher().events().is_empty());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.current_room().is_none());

        // The transport closes without a leave.
        while let Some(frame) = peer.recv().await {
            assert_ne!(frame.event_name(), Some(names::SHOW_LEAVE));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactivation_restores_room() {
        let (client, mut server) = client();
        let options = || BindingOptions::new().with_user("user-1").with_room("show-42");

        let binding = ShowBinding::activate(&client, options());
        let mut peer = accept(&mut server, "conn-1").await;
        expect_event(peer.recv().await.unwrap(), names::SHOW_JOIN);
        drop(binding);
        assert!(client.current_room().is_none());

        let _binding = ShowBinding::activate(&client, options());
        let mut peer = accept(&mut server, "conn-2").await;
        let join = expect_event(peer.recv().await.unwrap(), names::SHOW_JOIN);
        assert_eq!(join["roomId"], "show-42");
        assert_eq!(client.current_room().as_deref(), Some("show-42"));

        tokio::task::yield_now().await;
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_intents_require_live_room() {
        let (client, mut server) = client();
        let (tx, mut connected) = channel();

        let binding = ShowBinding::activate(&client, BindingOptions::new());
        assert!(!binding.send_update(json!({ "drones": [] })));
        assert!(!binding.update_cursor(1.0, 2.0));
        assert_eq!(binding.state(), ConnectionState::Disconnected);
        drop(binding);

        let binding = ShowBinding::activate(
            &client,
            BindingOptions::new()
                .with_user("user-1")
                .on(names::CONNECTED, move |d| {
                    let _ = tx.send(d.clone());
                }),
        );
        let mut peer = accept(&mut server, "conn-1").await;
        connected.recv().await.unwrap();

        // Live, but no room yet.
        assert!(!binding.sync_playback(true, 12.5));

        assert!(binding.join_show("show-7"));
        expect_event(peer.recv().await.unwrap(), names::SHOW_JOIN);

        assert!(binding.update_cursor(3.0, 4.0));
        let cursor = expect_event(peer.recv().await.unwrap(), names::CURSOR_MOVE);
        assert_eq!(cursor["roomId"], "show-7");
        assert_eq!(cursor["position"]["x"], 3.0);

        assert!(binding.move_formation("f-1", 42.0));
        let moved = expect_event(peer.recv().await.unwrap(), names::FORMATION_MOVE);
        assert_eq!(moved["formationId"], "f-1");
        assert_eq!(moved["startTime"], 42.0);

        assert!(binding.update_selection(vec!["d-1".into(), "d-2".into()]));
        let selection = expect_event(peer.recv().await.unwrap(), names::SELECTION_CHANGE);
        assert_eq!(selection["selectedIds"], json!(["d-1", "d-2"]));

        assert!(binding.send_update(json!({ "name": "Finale" })));
        let update = expect_event(peer.recv().await.unwrap(), names::SHOW_UPDATE);
        assert_eq!(update["updates"]["name"], "Finale");
        assert!(update["timestamp"].as_u64().unwrap() > 0);

        assert!(binding.start_live_preview());
        expect_event(peer.recv().await.unwrap(), names::PREVIEW_START);
        assert!(binding.stop_live_preview());
        expect_event(peer.recv().await.unwrap(), names::PREVIEW_STOP);

        assert!(binding.add_formation(json!({ "id": "f-2" })));
        expect_event(peer.recv().await.unwrap(), names::FORMATION_ADD);
        assert!(binding.remove_formation("f-2"));
        expect_event(peer.recv().await.unwrap(), names::FORMATION_REMOVE);

        assert!(binding.leave_show());
        expect_event(peer.recv().await.unwrap(), names::SHOW_LEAVE);
        assert!(!binding.update_cursor(0.0, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_from_heartbeat_pong() {
        let (client, mut server) = client();
        let (tx, mut latencies) = channel();

        let binding = ShowBinding::activate(
            &client,
            BindingOptions::new()
                .with_user("user-1")
                .on(names::LATENCY, move |d| {
                    let _ = tx.send(d.clone());
                }),
        );
        let mut peer = accept(&mut server, "conn-1").await;
        assert!(binding.latency().is_none());

        let ping = expect_event(peer.recv().await.unwrap(), names::PING);
        peer.send(Frame::event(names::PONG, ping.clone()));

        let measured = latencies.recv().await.unwrap();
        assert!(measured["latencyMs"].as_u64().is_some());
        assert!(binding.latency().is_some());
    }
}
