//! # skystage-relay
//!
//! Collaboration event relay client for SkyStage show editors.
//!
//! - **Client** - owns the connection, reconnect backoff and heartbeat
//! - **Dispatcher** - name-keyed callback registry for inbound and local events
//! - **Session** - the show room a connection has joined, restored on reconnect
//! - **Binding** - scopes handlers, connection and room to one editor view
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ ShowBinding │────▶│ CollabClient│────▶│  Connector  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                   │
//!        ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐
//! │ Dispatcher  │◀────│   Session   │
//! └─────────────┘     └─────────────┘
//! ```
//!
//! ```rust,ignore
//! use skystage_relay::{BindingOptions, CollabClient, RelayConfig, ShowBinding};
//!
//! let config = RelayConfig::load()?;
//! let client = CollabClient::from_config(&config);
//! let binding = ShowBinding::activate(
//!     &client,
//!     BindingOptions::new()
//!         .with_user("user-1")
//!         .with_room("show-42")
//!         .on("cursor:moved", |data| println!("{data}")),
//! );
//! binding.update_cursor(120.0, 48.0);
//! ```

pub mod backoff;
pub mod binding;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod session;
pub mod token;

pub use backoff::ReconnectPolicy;
pub use binding::{BindingOptions, ShowBinding};
pub use client::{ClientOptions, CollabClient, ConnectionState};
pub use config::RelayConfig;
pub use dispatcher::{Callback, EventDispatcher, ListenerId, Subscription};
pub use error::RelayError;
pub use heartbeat::LatencyTracker;
pub use session::{RoomMembership, SessionState};
pub use token::{FileTokenStore, MemoryTokenStore, TokenStore};
