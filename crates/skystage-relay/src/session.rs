//! Show room membership.
//!
//! A connection is in at most one show room at a time. The membership is
//! remembered across reconnects so the client can re-join transparently.

use skystage_protocol::events::{JoinShow, LeaveShow};
use tracing::debug;

/// The room a connection has joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMembership {
    /// Show room identifier.
    pub room_id: String,
    /// User that joined it.
    pub user_id: String,
}

impl RoomMembership {
    /// Intent that joins this room.
    #[must_use]
    pub fn join_intent(&self) -> JoinShow {
        JoinShow {
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
        }
    }

    /// Intent that leaves this room.
    #[must_use]
    pub fn leave_intent(&self) -> LeaveShow {
        LeaveShow {
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

/// Outcome of [`SessionState::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Already in that room as that user; nothing to send.
    Unchanged,
    /// Membership changed. `left` is the room implicitly left, if any.
    Joined {
        /// Previous membership.
        left: Option<RoomMembership>,
    },
}

/// Room membership of a single connection.
#[derive(Debug, Default)]
pub struct SessionState {
    current: Option<RoomMembership>,
}

impl SessionState {
    /// Create an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record membership of `room_id`, leaving any other room.
    pub fn join(&mut self, room_id: impl Into<String>, user_id: impl Into<String>) -> JoinOutcome {
        let next = RoomMembership {
            room_id: room_id.into(),
            user_id: user_id.into(),
        };

        if self.current.as_ref() == Some(&next) {
            return JoinOutcome::Unchanged;
        }

        let left = self.current.replace(next);
        if let Some(prev) = &left {
            debug!(room = %prev.room_id, "Implicitly leaving previous room");
        }
        JoinOutcome::Joined { left }
    }

    /// Forget the current membership, returning it.
    pub fn leave(&mut self) -> Option<RoomMembership> {
        self.current.take()
    }

    /// Current membership.
    #[must_use]
    pub fn current(&self) -> Option<&RoomMembership> {
        self.current.as_ref()
    }

    /// Join intent to re-issue after a reconnect.
    #[must_use]
    pub fn rejoin_intent(&self) -> Option<JoinShow> {
        self.current.as_ref().map(RoomMembership::join_intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_leave() {
        let mut session = SessionState::new();
        assert!(session.rejoin_intent().is_none());

        assert_eq!(
            session.join("show-42", "user-1"),
            JoinOutcome::Joined { left: None }
        );
        assert_eq!(session.current().unwrap().room_id, "show-42");

        let left = session.leave().unwrap();
        assert_eq!(left.leave_intent().room_id, "show-42");
        assert!(session.current().is_none());
        assert!(session.leave().is_none());
    }

    #[test]
    fn test_joining_another_room_leaves_the_first() {
        let mut session = SessionState::new();
        session.join("show-1", "user-1");

        match session.join("show-2", "user-1") {
            JoinOutcome::Joined { left: Some(prev) } => assert_eq!(prev.room_id, "show-1"),
            other => panic!("Expected implicit leave, got {:?}", other),
        }
        assert_eq!(session.current().unwrap().room_id, "show-2");
    }

    #[test]
    fn test_rejoining_same_room_is_unchanged() {
        let mut session = SessionState::new();
        session.join("show-42", "user-1");
        assert_eq!(session.join("show-42", "user-1"), JoinOutcome::Unchanged);

        let rejoin = session.rejoin_intent().unwrap();
        assert_eq!(rejoin.room_id, "show-42");
        assert_eq!(rejoin.user_id, "user-1");
    }
}
