//! # skystage-transport
//!
//! Client-side transport layer for the SkyStage collaboration relay.
//!
//! - **WebSocket** - the production connector
//! - **Memory** - an in-process connector whose server end is driven by hand,
//!   used to test reconnect and room recovery without a network
//!
//! ```rust,ignore
//! use skystage_transport::{handshake, ConnectRequest, Connector, WebSocketConnector};
//!
//! let request = ConnectRequest::new("ws://localhost:3001/ws", "user-1");
//! let mut conn = WebSocketConnector::default().connect(&request).await?;
//! handshake(conn.as_mut(), &request, Duration::from_secs(10)).await?;
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{
    handshake, ConnectRequest, Connection, ConnectionId, Connector, Handshake, TransportError,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnector};
