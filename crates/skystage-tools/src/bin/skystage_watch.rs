//! # skystage-watch
//!
//! Joins a show room and logs every event the relay delivers.
//!
//! ## Usage
//!
//! ```bash
//! # Watch show-42 as user-1 with settings from skystage.toml
//! skystage-watch user-1 show-42
//!
//! # Connect without joining a room
//! SKYSTAGE_WS_URL=ws://relay.local:3001/ws skystage-watch user-1
//! ```

use anyhow::{bail, Context, Result};
use skystage_protocol::names;
use skystage_relay::{BindingOptions, CollabClient, RelayConfig, ShowBinding};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Events logged as they arrive.
const WATCHED: &[&str] = &[
    names::USER_JOINED,
    names::USER_LEFT,
    names::ROOM_STATE,
    names::SHOW_UPDATED,
    names::FORMATION_ADDED,
    names::FORMATION_REMOVED,
    names::FORMATION_MOVED,
    names::PLAYBACK_SYNCED,
    names::CURSOR_MOVED,
    names::SELECTION_CHANGED,
    names::PREVIEW_STARTED,
    names::PREVIEW_STOPPED,
    names::CONNECTED,
    names::DISCONNECTED,
    names::RECONNECTING,
];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skystage_watch=info,skystage_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (user_id, room_id) = parse_args()?;
    let config = RelayConfig::load().context("Failed to load relay configuration")?;
    info!(url = %config.ws_url, user = %user_id, "Connecting");

    let client = CollabClient::from_config(&config);
    let mut options = BindingOptions::new().with_user(user_id);
    if let Some(room_id) = room_id {
        options = options.with_room(room_id);
    }
    for &event in WATCHED {
        options = options.on(event, move |data| info!(event, %data, "Event"));
    }
    options = options
        .on(names::ERROR, |data| warn!(%data, "Relay error"))
        .on(names::RECONNECT_FAILED, |data| warn!(%data, "Gave up reconnecting"))
        .on(names::LATENCY, |data| {
            info!(latency_ms = data["latencyMs"].as_u64(), "Latency")
        });

    let binding = ShowBinding::activate(&client, options);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!(state = %binding.state(), "Shutting down");
    binding.deactivate();
    Ok(())
}

/// `<user-id> [room-id]`
fn parse_args() -> Result<(String, Option<String>)> {
    let mut args = std::env::args().skip(1);
    let Some(user_id) = args.next() else {
        bail!("Usage: skystage-watch <user-id> [room-id]");
    };
    let room_id = args.next();
    if let Some(extra) = args.next() {
        bail!("Unexpected argument: {}", extra);
    }
    Ok((user_id, room_id))
}
