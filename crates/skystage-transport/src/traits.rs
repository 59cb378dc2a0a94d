//! Transport abstraction traits.
//!
//! A [`Connector`] opens client connections to a relay server; a
//! [`Connection`] moves frames over one of them. The relay client only ever
//! talks to these traits, so tests can swap the WebSocket connector for the
//! in-memory one.

use async_trait::async_trait;
use skystage_protocol::{Frame, PROTOCOL_VERSION};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Server-assigned identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the server has assigned an ID yet.
    #[must_use]
    pub fn is_assigned(&self) -> bool {
        !self.0.is_empty()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// An operation did not complete in time.
    #[error("Connection timed out")]
    Timeout,

    /// The server could not be reached.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// The server answered the handshake with something unexpected.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The server refused the connection with an error frame.
    #[error("Rejected by server ({code}): {message}")]
    Rejected {
        /// Error code from the server.
        code: u16,
        /// Message from the server.
        message: String,
    },

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] skystage_protocol::ProtocolError),
}

/// Everything a connector needs to open a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Server URL, e.g. `ws://localhost:3001/ws`.
    pub url: String,
    /// Bearer token attached to the handshake.
    pub token: Option<String>,
    /// User the connection acts for.
    pub user_id: String,
}

impl ConnectRequest {
    /// Create a request without a token.
    #[must_use]
    pub fn new(url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            user_id: user_id.into(),
        }
    }

    /// Attach a bearer token.
    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

/// Opens client connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection. The protocol handshake is not performed yet;
    /// see [`handshake`].
    async fn connect(&self, request: &ConnectRequest)
        -> Result<Box<dyn Connection>, TransportError>;

    /// Get the connector name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;
}

/// An open connection to a relay server.
///
/// `recv` must be cancel safe: the relay client polls it inside
/// `tokio::select!` alongside outbound traffic and timers.
#[async_trait]
pub trait Connection: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` if the connection was closed by the peer.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    /// Send a frame.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

/// Result of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Server-assigned connection ID.
    pub connection_id: ConnectionId,
    /// Heartbeat interval requested by the server, if any.
    pub heartbeat: Option<Duration>,
}

/// Perform the client side of the protocol handshake.
///
/// Sends a `connect` frame and waits for the server's `connected` reply.
///
/// # Errors
///
/// Returns [`TransportError::Timeout`] if no reply arrives in time,
/// [`TransportError::Rejected`] if the server answers with an error frame,
/// and [`TransportError::Handshake`] for any other reply.
pub async fn handshake(
    conn: &mut dyn Connection,
    request: &ConnectRequest,
    timeout: Duration,
) -> Result<Handshake, TransportError> {
    conn.send(Frame::connect(
        PROTOCOL_VERSION.wire(),
        request.token.clone(),
        request.user_id.clone(),
    ))
    .await?;

    let reply = tokio::time::timeout(timeout, conn.recv())
        .await
        .map_err(|_| TransportError::Timeout)??;

    match reply {
        Some(Frame::Connected {
            connection_id,
            version,
            heartbeat,
        }) => {
            PROTOCOL_VERSION.negotiate(version)?;
            debug!(connection = %connection_id, heartbeat_ms = heartbeat, "Handshake complete");
            Ok(Handshake {
                connection_id: connection_id.into(),
                heartbeat: (heartbeat > 0).then(|| Duration::from_millis(u64::from(heartbeat))),
            })
        }
        Some(Frame::Error { code, message }) => Err(TransportError::Rejected { code, message }),
        Some(other) => Err(TransportError::Handshake(format!(
            "expected connected frame, got {:?}",
            other.kind()
        ))),
        None => Err(TransportError::ConnectionClosed),
    }
}
