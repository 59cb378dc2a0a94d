//! Protocol versioning.
//!
//! Only the major number travels in the handshake; peers with the same
//! major version can talk to each other.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Breaking changes increment this.
    pub major: u8,
    /// Backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// The value sent in `Connect` / `Connected` frames.
    #[must_use]
    pub const fn wire(&self) -> u8 {
        self.major
    }

    /// Accept a peer's wire version if it shares our major version.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnsupportedVersion`] for any other major.
    pub fn negotiate(&self, peer_wire: u8) -> Result<Version, ProtocolError> {
        if peer_wire == self.major {
            Ok(*self)
        } else {
            Err(ProtocolError::UnsupportedVersion(peer_wire))
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
