//! In-process transport.
//!
//! [`pair`] returns a connector and the matching server end. Every
//! successful `connect` hands a [`MemoryPeer`] to the server end, which a
//! test drives by hand: answer the handshake, read intents, push events,
//! or drop the peer to simulate a server-initiated disconnect.

use async_trait::async_trait;
use skystage_protocol::{Frame, PROTOCOL_VERSION};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::traits::{ConnectRequest, Connection, Connector, TransportError};

#[derive(Debug, Default)]
struct Shared {
    refusing: AtomicBool,
    attempts: AtomicUsize,
}

/// Create a connected connector / server pair.
#[must_use]
pub fn pair() -> (MemoryConnector, MemoryServer) {
    let shared = Arc::new(Shared::default());
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            shared: Arc::clone(&shared),
            accept_tx,
        },
        MemoryServer { shared, accept_rx },
    )
}

/// Client half of the in-memory transport.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        request: &ConnectRequest,
    ) -> Result<Box<dyn Connection>, TransportError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);

        if self.shared.refusing.load(Ordering::SeqCst) {
            debug!(user = %request.user_id, "Memory server refusing connection");
            return Err(TransportError::ConnectFailed("connection refused".into()));
        }

        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            request: request.clone(),
            inbound: to_server_rx,
            outbound: to_client_tx,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::ConnectFailed("memory server dropped".into()))?;

        Ok(Box::new(MemoryConnection {
            outbound: Some(to_server_tx),
            inbound: to_client_rx,
            open: true,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Server half of the in-memory transport.
#[derive(Debug)]
pub struct MemoryServer {
    shared: Arc<Shared>,
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryServer {
    /// Wait for the next client connection.
    ///
    /// Returns `None` once every connector has been dropped.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Take a pending connection without waiting.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.try_recv().ok()
    }

    /// Make subsequent connects fail (or succeed again).
    pub fn set_refusing(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Total number of connect attempts, refused ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

/// Server-side view of one client connection.
#[derive(Debug)]
pub struct MemoryPeer {
    request: ConnectRequest,
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl MemoryPeer {
    /// The request the client connected with.
    #[must_use]
    pub fn request(&self) -> &ConnectRequest {
        &self.request
    }

    /// Receive the next frame sent by the client.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    /// Receive a frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.inbound.try_recv().ok()
    }

    /// Send a frame to the client. Returns `false` if the client is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    /// Read the client's `connect` frame and accept it.
    ///
    /// Returns the `connect` frame, or `None` if the client went away or
    /// opened with something else.
    pub async fn accept_handshake(
        &mut self,
        connection_id: &str,
        heartbeat_ms: u32,
    ) -> Option<Frame> {
        let frame = self.recv().await?;
        if !matches!(frame, Frame::Connect { .. }) {
            return None;
        }
        self.send(Frame::connected(
            connection_id,
            PROTOCOL_VERSION.wire(),
            heartbeat_ms,
        ));
        Some(frame)
    }
}

/// Client-side memory connection.
#[derive(Debug)]
pub struct MemoryConnection {
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    inbound: mpsc::UnboundedReceiver<Frame>,
    open: bool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        let frame = self.inbound.recv().await;
        if frame.is_none() {
            self.open = false;
        }
        Ok(frame)
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;
        outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        self.outbound = None;
        self.inbound.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}
