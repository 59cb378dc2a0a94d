//! # skystage-server
//!
//! Development relay server for SkyStage collaboration.
//!
//! Accepts relay clients over WebSocket, tracks which show room each
//! connection joined, and rebroadcasts editing intents to the other members
//! of the room under their past-tense names (`cursor:move` arrives at peers
//! as `cursor:moved`). Nothing is persisted and nothing is ordered beyond
//! what a single socket gives.

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod rooms;

pub use config::Config;
pub use handlers::{router, run_server, serve, AppState};
pub use rooms::{RoomError, RoomLimits, RoomRegistry};
