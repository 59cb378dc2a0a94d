//! Show room registry.
//!
//! Tracks which connection is in which show room and fans relayed events
//! out to the other members. A connection is in at most one room; joining
//! another room leaves the first.
//!
//! Guards on the two maps are never held at the same time, and never
//! across a send.

use dashmap::DashMap;
use serde_json::{json, Value};
use skystage_protocol::events::{PresenceChange, RoomMember, RoomState};
use skystage_protocol::{codec, names, Frame};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// Room registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// The connection is not registered.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// The connection is not in the named room (or in any room).
    #[error("Not in room: {0}")]
    NotInRoom(String),

    /// The server already hosts the maximum number of rooms.
    #[error("Maximum rooms reached")]
    MaxRoomsReached,

    /// The room already holds the maximum number of members.
    #[error("Room is full: {0}")]
    RoomFull(String),

    /// The relayed frame would exceed the message size limit.
    #[error("Relayed frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Encoded size of the relayed frame.
        size: usize,
        /// Configured limit.
        max: usize,
    },
}

/// Room registry limits.
#[derive(Debug, Clone)]
pub struct RoomLimits {
    /// Maximum number of rooms.
    pub max_rooms: usize,
    /// Maximum members per room.
    pub max_room_members: usize,
    /// Maximum encoded size of a relayed frame, in either encoding.
    pub max_message_size: usize,
}

impl Default for RoomLimits {
    fn default() -> Self {
        Self {
            max_rooms: 10_000,
            max_room_members: 100,
            max_message_size: 64 * 1024,
        }
    }
}

/// Outbound queue of one connection.
pub type Outbox = mpsc::UnboundedSender<Frame>;

struct ConnectionEntry {
    user_id: String,
    room: Option<String>,
    outbox: Outbox,
}

#[derive(Default)]
struct Room {
    /// Members keyed by connection ID.
    members: HashMap<String, RoomMember>,
}

impl Room {
    fn snapshot(&self, room_id: &str) -> RoomState {
        let mut members: Vec<RoomMember> = self.members.values().cloned().collect();
        members.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.connection_id.cmp(&b.connection_id))
        });
        RoomState {
            room_id: room_id.to_string(),
            members,
        }
    }
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq)]
pub struct Joined {
    /// Room implicitly left, if any.
    pub left: Option<String>,
    /// Membership after the join.
    pub state: RoomState,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Registry of live connections and the rooms they joined.
pub struct RoomRegistry {
    connections: DashMap<String, ConnectionEntry>,
    rooms: DashMap<String, Room>,
    limits: RoomLimits,
}

impl RoomRegistry {
    /// Create a registry with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(RoomLimits::default())
    }

    /// Create a registry with custom limits.
    #[must_use]
    pub fn with_limits(limits: RoomLimits) -> Self {
        debug!(?limits, "Creating room registry");
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            limits,
        }
    }

    /// Register a connection after its handshake.
    pub fn register(&self, connection_id: &str, user_id: &str, outbox: Outbox) {
        self.connections.insert(
            connection_id.to_string(),
            ConnectionEntry {
                user_id: user_id.to_string(),
                room: None,
                outbox,
            },
        );
        trace!(connection = %connection_id, user = %user_id, "Connection registered");
    }

    /// Forget a connection, leaving its room.
    ///
    /// Returns the room it was in.
    pub fn unregister(&self, connection_id: &str) -> Option<String> {
        let (_, entry) = self.connections.remove(connection_id)?;
        let room_id = entry.room?;
        self.remove_member(&room_id, connection_id, &entry.user_id);
        Some(room_id)
    }

    /// Put a connection in a room, leaving any other room first.
    ///
    /// Joining the room the connection is already in changes nothing and
    /// returns the current membership.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid, the connection is
    /// unknown, or a limit would be exceeded.
    pub fn join(&self, connection_id: &str, room_id: &str) -> Result<Joined, RoomError> {
        validate_room_name(room_id).map_err(RoomError::InvalidRoom)?;

        let (user_id, current) = {
            let entry = self
                .connections
                .get(connection_id)
                .ok_or_else(|| RoomError::UnknownConnection(connection_id.to_string()))?;
            (entry.user_id.clone(), entry.room.clone())
        };

        if current.as_deref() == Some(room_id) {
            let state = self
                .room_state(room_id)
                .ok_or_else(|| RoomError::NotInRoom(room_id.to_string()))?;
            return Ok(Joined { left: None, state });
        }

        if !self.rooms.contains_key(room_id) && self.rooms.len() >= self.limits.max_rooms {
            return Err(RoomError::MaxRoomsReached);
        }

        let state = {
            let mut room = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
                debug!(room = %room_id, "Creating room");
                Room::default()
            });
            if room.members.len() >= self.limits.max_room_members {
                let empty = room.members.is_empty();
                drop(room);
                if empty {
                    self.rooms.remove_if(room_id, |_, r| r.members.is_empty());
                }
                return Err(RoomError::RoomFull(room_id.to_string()));
            }
            room.members.insert(
                connection_id.to_string(),
                RoomMember {
                    user_id: user_id.clone(),
                    connection_id: connection_id.to_string(),
                    joined_at: now_millis(),
                },
            );
            room.snapshot(room_id)
        };

        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.room = Some(room_id.to_string());
        }

        if let Some(prev) = &current {
            self.remove_member(prev, connection_id, &user_id);
        }

        debug!(
            room = %room_id,
            connection = %connection_id,
            members = state.members.len(),
            "Joined room"
        );

        let joined = presence_frame(names::USER_JOINED, room_id, &user_id, connection_id);
        self.broadcast(room_id, Some(connection_id), &joined);

        Ok(Joined {
            left: current,
            state,
        })
    }

    /// Take a connection out of its room.
    ///
    /// If `room_id` is given it must match the room the connection is in.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::NotInRoom`] if the connection is not in that room.
    pub fn leave(&self, connection_id: &str, room_id: Option<&str>) -> Result<String, RoomError> {
        let (user_id, current) = {
            let mut entry = self
                .connections
                .get_mut(connection_id)
                .ok_or_else(|| RoomError::UnknownConnection(connection_id.to_string()))?;

            let matches = match (&entry.room, room_id) {
                (Some(current), Some(wanted)) => current == wanted,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !matches {
                return Err(RoomError::NotInRoom(
                    room_id.unwrap_or_default().to_string(),
                ));
            }
            (entry.user_id.clone(), entry.room.take())
        };

        let room_id = current.ok_or_else(|| RoomError::NotInRoom(String::new()))?;
        self.remove_member(&room_id, connection_id, &user_id);
        Ok(room_id)
    }

    /// Send an event to every other member of the sender's room.
    ///
    /// Returns the number of recipients.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::NotInRoom`] if the sender has not joined a room,
    /// or [`RoomError::FrameTooLarge`] if the relayed frame would not fit in
    /// a message. Nothing is sent in either case.
    pub fn relay(
        &self,
        connection_id: &str,
        event: &str,
        data: Value,
    ) -> Result<usize, RoomError> {
        let room_id = self
            .connections
            .get(connection_id)
            .ok_or_else(|| RoomError::UnknownConnection(connection_id.to_string()))?
            .room
            .clone()
            .ok_or_else(|| RoomError::NotInRoom(String::new()))?;

        let frame = Frame::event(event, data);
        let size = encoded_size(&frame);
        if size > self.limits.max_message_size {
            warn!(room = %room_id, event = %event, size, "Refusing to relay oversize frame");
            return Err(RoomError::FrameTooLarge {
                size,
                max: self.limits.max_message_size,
            });
        }

        let count = self.broadcast(&room_id, Some(connection_id), &frame);
        trace!(room = %room_id, event = %event, recipients = count, "Relayed event");
        Ok(count)
    }

    /// Membership snapshot of a room.
    #[must_use]
    pub fn room_state(&self, room_id: &str) -> Option<RoomState> {
        self.rooms.get(room_id).map(|r| r.snapshot(room_id))
    }

    /// Room a connection is in.
    #[must_use]
    pub fn connection_room(&self, connection_id: &str) -> Option<String> {
        self.connections
            .get(connection_id)
            .and_then(|e| e.room.clone())
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RoomStats {
        RoomStats {
            room_count: self.rooms.len(),
            connection_count: self.connections.len(),
            member_count: self.rooms.iter().map(|r| r.members.len()).sum(),
        }
    }

    fn remove_member(&self, room_id: &str, connection_id: &str, user_id: &str) {
        let removed = match self.rooms.get_mut(room_id) {
            Some(mut room) => room.members.remove(connection_id).is_some(),
            None => false,
        };
        if !removed {
            return;
        }

        if self
            .rooms
            .remove_if(room_id, |_, r| r.members.is_empty())
            .is_some()
        {
            debug!(room = %room_id, "Deleted empty room");
            return;
        }

        debug!(room = %room_id, connection = %connection_id, "Left room");
        let left = presence_frame(names::USER_LEFT, room_id, user_id, connection_id);
        self.broadcast(room_id, None, &left);
    }

    fn broadcast(&self, room_id: &str, except: Option<&str>, frame: &Frame) -> usize {
        let recipients: Vec<String> = match self.rooms.get(room_id) {
            Some(room) => room
                .members
                .keys()
                .filter(|id| Some(id.as_str()) != except)
                .cloned()
                .collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for id in recipients {
            let sent = self
                .connections
                .get(&id)
                .map(|e| e.outbox.send(frame.clone()).is_ok())
                .unwrap_or(false);
            if sent {
                delivered += 1;
            } else {
                warn!(room = %room_id, connection = %id, "Dropping event for closed connection");
            }
        }
        delivered
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Largest message a frame becomes on the wire, binary or text.
fn encoded_size(frame: &Frame) -> usize {
    let binary = codec::encode(frame).map_or(usize::MAX, |b| b.len());
    let text = codec::encode_text(frame).map_or(usize::MAX, |t| t.len());
    binary.max(text)
}

fn presence_frame(event: &str, room_id: &str, user_id: &str, connection_id: &str) -> Frame {
    let change = PresenceChange {
        room_id: room_id.to_string(),
        user_id: user_id.to_string(),
        connection_id: connection_id.to_string(),
    };
    Frame::event(
        event,
        serde_json::to_value(change).unwrap_or_else(|_| json!({})),
    )
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RoomStats {
    /// Number of rooms with at least one member.
    pub room_count: usize,
    /// Number of registered connections.
    pub connection_count: usize,
    /// Total room memberships.
    pub member_count: usize,
}
