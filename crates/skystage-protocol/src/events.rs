//! Event names and typed payloads exchanged over the relay.
//!
//! Outbound intents implement [`Intent`], which ties a payload type to the
//! event name it travels under. Payloads use camelCase field names so that
//! browser peers and the relay server can share them unchanged.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event names.
pub mod names {
    // Outbound intents.
    pub const SHOW_JOIN: &str = "show:join";
    pub const SHOW_LEAVE: &str = "show:leave";
    pub const SHOW_UPDATE: &str = "show:update";
    pub const FORMATION_ADD: &str = "formation:add";
    pub const FORMATION_REMOVE: &str = "formation:remove";
    pub const FORMATION_MOVE: &str = "formation:move";
    pub const PLAYBACK_SYNC: &str = "playback:sync";
    pub const CURSOR_MOVE: &str = "cursor:move";
    pub const SELECTION_CHANGE: &str = "selection:change";
    pub const PREVIEW_START: &str = "preview:start";
    pub const PREVIEW_STOP: &str = "preview:stop";
    pub const PING: &str = "ping";

    // Inbound from the server.
    pub const PONG: &str = "pong";
    pub const USER_JOINED: &str = "user:joined";
    pub const USER_LEFT: &str = "user:left";
    pub const ROOM_STATE: &str = "room:state";
    pub const SHOW_UPDATED: &str = "show:updated";
    pub const FORMATION_ADDED: &str = "formation:added";
    pub const FORMATION_REMOVED: &str = "formation:removed";
    pub const FORMATION_MOVED: &str = "formation:moved";
    pub const PLAYBACK_SYNCED: &str = "playback:synced";
    pub const CURSOR_MOVED: &str = "cursor:moved";
    pub const SELECTION_CHANGED: &str = "selection:changed";
    pub const PREVIEW_STARTED: &str = "preview:started";
    pub const PREVIEW_STOPPED: &str = "preview:stopped";

    // Local notifications. These never go on the wire.
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
    pub const ERROR: &str = "error";
    pub const RECONNECTING: &str = "reconnecting";
    pub const RECONNECT_FAILED: &str = "reconnect:failed";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const LATENCY: &str = "latency";
}

/// Map an outbound intent to the name the server rebroadcasts it under.
///
/// Returns `None` for events that are not relayed to peers.
#[must_use]
pub fn relayed_name(intent: &str) -> Option<&'static str> {
    match intent {
        names::SHOW_UPDATE => Some(names::SHOW_UPDATED),
        names::FORMATION_ADD => Some(names::FORMATION_ADDED),
        names::FORMATION_REMOVE => Some(names::FORMATION_REMOVED),
        names::FORMATION_MOVE => Some(names::FORMATION_MOVED),
        names::PLAYBACK_SYNC => Some(names::PLAYBACK_SYNCED),
        names::CURSOR_MOVE => Some(names::CURSOR_MOVED),
        names::SELECTION_CHANGE => Some(names::SELECTION_CHANGED),
        names::PREVIEW_START => Some(names::PREVIEW_STARTED),
        names::PREVIEW_STOP => Some(names::PREVIEW_STOPPED),
        _ => None,
    }
}

/// Whether an event name is generated locally by the client.
#[must_use]
pub fn is_local(event: &str) -> bool {
    matches!(
        event,
        names::CONNECTED
            | names::DISCONNECTED
            | names::ERROR
            | names::RECONNECTING
            | names::RECONNECT_FAILED
            | names::HEARTBEAT
            | names::LATENCY
    )
}

/// A typed payload bound to an event name.
pub trait Intent: Serialize + DeserializeOwned {
    /// The event this payload travels under.
    const EVENT: &'static str;
}

macro_rules! intent {
    ($ty:ty, $name:expr) => {
        impl Intent for $ty {
            const EVENT: &'static str = $name;
        }
    };
}

/// Join a show room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinShow {
    pub room_id: String,
    pub user_id: String,
}

/// Leave a show room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveShow {
    pub room_id: String,
    pub user_id: String,
}

/// A change to the show document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowUpdate {
    pub room_id: String,
    pub user_id: String,
    /// Opaque change set produced by the editor.
    pub updates: Value,
    /// Client wall-clock time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// A formation was placed on the show timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormationAdd {
    pub room_id: String,
    pub user_id: String,
    pub formation: Value,
}

/// A formation was removed from the show timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormationRemove {
    pub room_id: String,
    pub user_id: String,
    pub formation_id: String,
}

/// A formation was moved to a new start time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormationMove {
    pub room_id: String,
    pub user_id: String,
    pub formation_id: String,
    /// New start time on the show timeline, in seconds.
    pub start_time: f64,
}

/// Playback position shared between editors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSync {
    pub room_id: String,
    pub user_id: String,
    pub is_playing: bool,
    /// Playhead position, in seconds.
    pub current_time: f64,
}

/// A point in editor canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// The local cursor moved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMove {
    pub room_id: String,
    pub user_id: String,
    pub position: CursorPosition,
}

/// The local selection changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionChange {
    pub room_id: String,
    pub user_id: String,
    pub selected_ids: Vec<String>,
}

/// Start streaming the 3D preview to the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewStart {
    pub room_id: String,
    pub user_id: String,
}

/// Stop streaming the 3D preview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewStop {
    pub room_id: String,
    pub user_id: String,
}

/// Liveness probe. The server echoes the timestamp back in a [`Pong`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Milliseconds since the Unix epoch when the ping was sent.
    pub timestamp: u64,
}

/// Reply to a [`Ping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp: u64,
}

intent!(JoinShow, names::SHOW_JOIN);
intent!(LeaveShow, names::SHOW_LEAVE);
intent!(ShowUpdate, names::SHOW_UPDATE);
intent!(FormationAdd, names::FORMATION_ADD);
intent!(FormationRemove, names::FORMATION_REMOVE);
intent!(FormationMove, names::FORMATION_MOVE);
intent!(PlaybackSync, names::PLAYBACK_SYNC);
intent!(CursorMove, names::CURSOR_MOVE);
intent!(SelectionChange, names::SELECTION_CHANGE);
intent!(PreviewStart, names::PREVIEW_START);
intent!(PreviewStop, names::PREVIEW_STOP);
intent!(Ping, names::PING);
intent!(Pong, names::PONG);

/// A member of a show room, as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub user_id: String,
    pub connection_id: String,
    /// Milliseconds since the Unix epoch.
    pub joined_at: u64,
}

/// Presence change broadcast to a room (`user:joined` / `user:left`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChange {
    pub room_id: String,
    pub user_id: String,
    pub connection_id: String,
}

/// Full membership snapshot sent to a client after it joins (`room:state`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub room_id: String,
    pub members: Vec<RoomMember>,
}
