//! Connection handlers for the relay server.
//!
//! This module handles the connection lifecycle and event processing:
//! handshake, room membership, relaying intents to the rest of the room and
//! answering heartbeats.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::rooms::{RoomError, RoomRegistry};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use skystage_protocol::events::{relayed_name, JoinShow, LeaveShow, Ping, Pong};
use skystage_protocol::{codec, error_codes, names, Frame, ProtocolError, PROTOCOL_VERSION};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Shared server state.
pub struct AppState {
    /// Connections and show rooms.
    pub rooms: RoomRegistry,
    /// Server configuration.
    pub config: Config,
    next_connection: AtomicU64,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            rooms: RoomRegistry::with_limits(config.room_limits()),
            config,
            next_connection: AtomicU64::new(1),
        }
    }

    fn next_connection_id(&self) -> String {
        format!("conn-{}", self.next_connection.fetch_add(1, Ordering::Relaxed))
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("SkyStage relay listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let state = Arc::new(AppState::new(config));
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if serving fails.
pub async fn serve(listener: TcpListener, config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config));
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.rooms.stats();
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "connections": stats.connection_count,
        "rooms": stats.room_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.rooms.connection_count() >= state.config.limits.max_connections {
        warn!("Connection limit reached, refusing upgrade");
        metrics::record_error("connection_limit");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, bearer))
}

/// How a client encodes its frames. Replies use the same encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Binary,
    Text,
}

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, bearer: Option<String>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = state.next_connection_id();
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);

    let handshake_timeout = Duration::from_millis(state.config.transport.handshake_timeout_ms);
    let first = tokio::time::timeout(
        handshake_timeout,
        first_frame(&mut receiver, &mut read_buffer),
    )
    .await;

    let (hello, encoding) = match first {
        Ok(Ok(Some(first))) => first,
        Ok(Ok(None)) => {
            debug!(connection = %connection_id, "Closed before handshake");
            return;
        }
        Ok(Err(e)) => {
            warn!(connection = %connection_id, error = %e, "Malformed handshake");
            metrics::record_rejected_handshake("malformed");
            let reject = Frame::error(error_codes::MALFORMED_FRAME, e.to_string());
            let _ = send_frame(&mut sender, &reject, Encoding::Binary).await;
            return;
        }
        Err(_) => {
            debug!(connection = %connection_id, "Handshake timed out");
            metrics::record_rejected_handshake("timeout");
            return;
        }
    };

    let user_id = match accept_handshake(&state.config, hello, bearer.as_deref()) {
        Ok(user_id) => user_id,
        Err((reject, reason)) => {
            warn!(connection = %connection_id, reason, "Handshake rejected");
            metrics::record_rejected_handshake(reason);
            let _ = send_frame(&mut sender, &reject, encoding).await;
            let _ = sender.close().await;
            return;
        }
    };

    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = Frame::connected(&connection_id, PROTOCOL_VERSION.wire(), heartbeat);
    if send_frame(&mut sender, &connected, encoding).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        return;
    }

    let (outbox, mut outbox_rx) = mpsc::unbounded_channel();
    state.rooms.register(&connection_id, &user_id, outbox.clone());
    info!(connection = %connection_id, user = %user_id, "Client connected");

    let idle_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut deadline = Instant::now() + idle_timeout;

    // Message processing loop
    loop {
        tokio::select! {
            Some(frame) = outbox_rx.recv() => {
                if send_frame(&mut sender, &frame, encoding).await.is_err() {
                    break;
                }
            }

            _ = tokio::time::sleep_until(deadline) => {
                debug!(connection = %connection_id, "Idle timeout");
                break;
            }

            msg = receiver.next() => {
                deadline = Instant::now() + idle_timeout;
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => {
                                    handle_frame(frame, &connection_id, &state, &outbox);
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(connection = %connection_id, error = %e, "Bad frame");
                                    metrics::record_error("decode");
                                    read_buffer.clear();
                                    let _ = outbox.send(malformed(&e));
                                    break;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_message(text.len(), "inbound");
                        match codec::decode_text(&text) {
                            Ok(frame) => handle_frame(frame, &connection_id, &state, &outbox),
                            Err(e) => {
                                warn!(connection = %connection_id, error = %e, "Bad text frame");
                                metrics::record_error("decode");
                                let _ = outbox.send(malformed(&e));
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    if let Some(room) = state.rooms.unregister(&connection_id) {
        debug!(connection = %connection_id, room = %room, "Removed from room on disconnect");
    }
    metrics::set_active_rooms(state.rooms.stats().room_count);

    info!(connection = %connection_id, "Client disconnected");
}

/// Read until the first complete frame.
async fn first_frame(
    receiver: &mut WsReceiver,
    buf: &mut BytesMut,
) -> Result<Option<(Frame, Encoding)>, ProtocolError> {
    loop {
        if let Some(frame) = codec::decode_from(buf)? {
            return Ok(Some((frame, Encoding::Binary)));
        }
        match receiver.next().await {
            Some(Ok(Message::Binary(data))) => buf.extend_from_slice(&data),
            Some(Ok(Message::Text(text))) => {
                return codec::decode_text(&text).map(|f| Some((f, Encoding::Text)));
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Ok(None),
        }
    }
}

/// Validate a `connect` frame. Returns the user ID, or the error frame to
/// reply with and a reason label for metrics.
fn accept_handshake(
    config: &Config,
    frame: Frame,
    bearer: Option<&str>,
) -> std::result::Result<String, (Frame, &'static str)> {
    let Frame::Connect {
        version,
        token,
        user_id,
    } = frame
    else {
        return Err((
            Frame::error(error_codes::BAD_HANDSHAKE, "Expected connect frame"),
            "handshake",
        ));
    };

    if let Err(e) = PROTOCOL_VERSION.negotiate(version) {
        return Err((
            Frame::error(error_codes::UNSUPPORTED_VERSION, e.to_string()),
            "version",
        ));
    }

    if user_id.is_empty() {
        return Err((
            Frame::error(error_codes::BAD_HANDSHAKE, "Missing user id"),
            "handshake",
        ));
    }

    if config.auth.require_token && token.is_none() && bearer.is_none() {
        return Err((
            Frame::error(error_codes::BAD_HANDSHAKE, "Missing bearer token"),
            "auth",
        ));
    }

    Ok(user_id)
}

/// Handle a decoded frame. Replies go to the connection's own outbox.
fn handle_frame(
    frame: Frame,
    connection_id: &str,
    state: &AppState,
    outbox: &mpsc::UnboundedSender<Frame>,
) {
    match frame {
        Frame::Event { event, data } => {
            trace!(connection = %connection_id, event = %event, "Event");
            if let Some(reply) = handle_event(&event, data, connection_id, state) {
                let _ = outbox.send(reply);
            }
        }
        Frame::Connect { .. } => {
            debug!(connection = %connection_id, "Connect frame (already connected)");
        }
        other => {
            warn!(connection = %connection_id, kind = ?other.kind(), "Unexpected frame type");
        }
    }
}

fn handle_event(
    event: &str,
    data: Value,
    connection_id: &str,
    state: &AppState,
) -> Option<Frame> {
    match event {
        names::SHOW_JOIN => {
            let join: JoinShow = match parse(event, data) {
                Ok(join) => join,
                Err(reply) => return Some(reply),
            };
            match state.rooms.join(connection_id, &join.room_id) {
                Ok(joined) => {
                    metrics::record_room_join();
                    metrics::set_active_rooms(state.rooms.stats().room_count);
                    if let Some(left) = joined.left {
                        debug!(connection = %connection_id, room = %left, "Left previous room");
                    }
                    match serde_json::to_value(&joined.state) {
                        Ok(snapshot) => Some(Frame::event(names::ROOM_STATE, snapshot)),
                        Err(e) => {
                            error!(error = %e, "Failed to encode room state");
                            None
                        }
                    }
                }
                Err(e) => Some(room_error(connection_id, &e)),
            }
        }

        names::SHOW_LEAVE => {
            let leave: LeaveShow = match parse(event, data) {
                Ok(leave) => leave,
                Err(reply) => return Some(reply),
            };
            match state.rooms.leave(connection_id, Some(&leave.room_id)) {
                Ok(_) => {
                    metrics::set_active_rooms(state.rooms.stats().room_count);
                    None
                }
                Err(e) => Some(room_error(connection_id, &e)),
            }
        }

        names::PING => match parse::<Ping>(event, data) {
            Ok(ping) => {
                let pong = Pong {
                    timestamp: ping.timestamp,
                };
                match Frame::intent(&pong) {
                    Ok(frame) => Some(frame),
                    Err(e) => {
                        error!(error = %e, "Failed to encode pong");
                        None
                    }
                }
            }
            Err(reply) => Some(reply),
        },

        other => match relayed_name(other) {
            Some(relayed) => match state.rooms.relay(connection_id, relayed, data) {
                Ok(recipients) => {
                    metrics::record_relayed(relayed, recipients);
                    None
                }
                Err(e) => Some(room_error(connection_id, &e)),
            },
            None => {
                warn!(connection = %connection_id, event = %other, "Unknown event");
                metrics::record_error("unknown_event");
                Some(Frame::error(
                    error_codes::MALFORMED_FRAME,
                    format!("Unknown event: {}", other),
                ))
            }
        },
    }
}

fn malformed(error: &ProtocolError) -> Frame {
    Frame::error(error_codes::MALFORMED_FRAME, error.to_string())
}

fn parse<T: DeserializeOwned>(event: &str, data: Value) -> std::result::Result<T, Frame> {
    serde_json::from_value(data).map_err(|e| {
        metrics::record_error("payload");
        Frame::error(
            error_codes::MALFORMED_FRAME,
            format!("Invalid {} payload: {}", event, e),
        )
    })
}

fn room_error(connection_id: &str, error: &RoomError) -> Frame {
    debug!(connection = %connection_id, error = %error, "Room operation failed");
    let code = match error {
        RoomError::NotInRoom(_) => error_codes::NOT_IN_ROOM,
        RoomError::MaxRoomsReached | RoomError::RoomFull(_) | RoomError::FrameTooLarge { .. } => {
            error_codes::LIMIT_EXCEEDED
        }
        RoomError::InvalidRoom(_) | RoomError::UnknownConnection(_) => {
            error_codes::MALFORMED_FRAME
        }
    };
    Frame::error(code, error.to_string())
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, frame: &Frame, encoding: Encoding) -> Result<()> {
    let message = match encoding {
        Encoding::Binary => Message::Binary(codec::encode(frame)?.to_vec()),
        Encoding::Text => Message::Text(codec::encode_text(frame)?),
    };
    let len = match &message {
        Message::Binary(data) => data.len(),
        Message::Text(text) => text.len(),
        _ => 0,
    };
    metrics::record_message(len, "outbound");
    sender.send(message).await?;
    Ok(())
}
