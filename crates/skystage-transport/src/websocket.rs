//! WebSocket connector.
//!
//! This module opens client connections to a relay server using
//! tokio-tungstenite. The bearer token rides on the upgrade request's
//! `Authorization` header as well as in the protocol handshake.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use skystage_protocol::{codec, error_codes, Frame, ProtocolError};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

use crate::traits::{ConnectRequest, Connection, Connector, TransportError};

/// WebSocket connector configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes. Larger messages are skipped
    /// and reported as a `LIMIT_EXCEEDED` error frame.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: codec::MAX_FRAME_SIZE + codec::LENGTH_PREFIX_SIZE,
        }
    }
}

/// Opens WebSocket connections to a relay server.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    /// Create a connector with the given configuration.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        request: &ConnectRequest,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let mut upgrade = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectFailed(format!("invalid url: {}", e)))?;

        if let Some(token) = &request.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::ConnectFailed(format!("invalid token: {}", e)))?;
            upgrade.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, response) = connect_async(upgrade).await.map_err(|e| {
            debug!(url = %request.url, error = %e, "WebSocket connect failed");
            TransportError::ConnectFailed(e.to_string())
        })?;

        debug!(url = %request.url, status = %response.status(), "WebSocket connected");

        Ok(Box::new(WebSocketConnection::new(
            stream,
            request.url.clone(),
            self.config.max_message_size,
        )))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// A client WebSocket connection.
pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    url: String,
    is_open: bool,
    read_buffer: BytesMut,
    max_message_size: usize,
}

impl WebSocketConnection {
    fn new(
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        url: String,
        max_message_size: usize,
    ) -> Self {
        Self {
            stream,
            url,
            is_open: true,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size,
        }
    }

    /// Stand-in for a skipped oversize message.
    fn oversize(&self, size: usize) -> Frame {
        let error = ProtocolError::too_large(size, self.max_message_size);
        warn!(url = %self.url, error = %error, "Skipping oversize message");
        Frame::error(error_codes::LIMIT_EXCEEDED, error.to_string())
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        // A previous binary message may have carried several frames.
        if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
            return Ok(Some(frame));
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > self.max_message_size {
                        return Ok(Some(self.oversize(data.len())));
                    }

                    self.read_buffer.extend_from_slice(&data);

                    if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
                        return Ok(Some(frame));
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if text.len() > self.max_message_size {
                        return Ok(Some(self.oversize(text.len())));
                    }
                    return Ok(Some(codec::decode_text(&text)?));
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(reason))) => {
                    debug!(url = %self.url, ?reason, "Server closed connection");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!(url = %self.url, "WebSocket error: {}", e);
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(url = %self.url, "WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let data = codec::encode(&frame)?;
        self.stream
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;

        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.is_open
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(
            config.max_message_size,
            codec::MAX_FRAME_SIZE + codec::LENGTH_PREFIX_SIZE
        );
        assert_eq!(WebSocketConnector::default().name(), "websocket");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 on loopback is reserved and never listening.
        let connector = WebSocketConnector::default();
        let request = ConnectRequest::new("ws://127.0.0.1:1/ws", "user-1");
        assert!(matches!(
            connector.connect(&request).await,
            Err(TransportError::ConnectFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_oversize_message_skipped() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let big = Frame::event("show:updated", serde_json::json!("x".repeat(256)));
            let small = Frame::event("cursor:moved", serde_json::json!({ "x": 1 }));
            for frame in [big, small] {
                let data = codec::encode(&frame).unwrap();
                ws.send(Message::Binary(data.to_vec())).await.unwrap();
            }
            // Hold the socket open until the client hangs up.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let connector = WebSocketConnector::new(WebSocketConfig {
            max_message_size: 128,
        });
        let mut conn = connector
            .connect(&ConnectRequest::new(url, "user-1"))
            .await
            .unwrap();

        match conn.recv().await.unwrap() {
            Some(Frame::Error { code, message }) => {
                assert_eq!(code, error_codes::LIMIT_EXCEEDED);
                assert!(message.ends_with("exceeds maximum 128"));
            }
            other => panic!("Expected limit error, got {:?}", other),
        }
        assert!(conn.is_open());
        assert_eq!(
            conn.recv().await.unwrap().and_then(|f| f.event_name().map(str::to_string)),
            Some("cursor:moved".to_string())
        );

        conn.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let connector = WebSocketConnector::default();
        let request = ConnectRequest::new("not a url", "user-1");
        assert!(matches!(
            connector.connect(&request).await,
            Err(TransportError::ConnectFailed(_))
        ));
    }
}
