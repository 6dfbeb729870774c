//! Local connection table and the socket seam.
//!
//! The messenger never touches a concrete WebSocket type: sockets enter as
//! [`ClientSocket`] trait objects and are split into a read half (owned by
//! the per-client read loop) and a write half (shared behind the
//! connection's write mutex).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

/// Socket-level error.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("socket closed")]
    Closed,
    #[error("socket io error: {0}")]
    Io(String),
}

/// Read half of a client socket: one text frame at a time.
#[async_trait]
pub trait PacketStream: Send {
    /// `None` means clean end-of-stream; an error means the connection is
    /// unusable. Either way the read loop detaches the client.
    async fn next_text(&mut self) -> Option<Result<String, SocketError>>;
}

/// Write half of a client socket.
#[async_trait]
pub trait PacketSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SocketError>;
    async fn close(&mut self) -> Result<(), SocketError>;
}

/// A full-duplex client socket, split on attach.
pub trait ClientSocket: Send {
    fn split(self: Box<Self>) -> (Box<dyn PacketStream>, Box<dyn PacketSink>);
}

/// One attached client.
pub struct Connection {
    client_id: String,
    // At most one writer to the socket at a time.
    sink: Mutex<Box<dyn PacketSink>>,
}

impl Connection {
    pub(crate) fn new(client_id: String, sink: Box<dyn PacketSink>) -> Self {
        Self {
            client_id,
            sink: Mutex::new(sink),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(crate) async fn send_text(&self, text: String) -> Result<(), SocketError> {
        self.sink.lock().await.send_text(text).await
    }

    pub(crate) async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

/// Thread-safe `client_id → connection` table, exclusively owned by its
/// replica.
#[derive(Default)]
pub struct LocalConnections {
    inner: RwLock<HashMap<String, Arc<Connection>>>,
}

impl LocalConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, client_id: &str, connection: Arc<Connection>) {
        self.inner
            .write()
            .unwrap()
            .insert(client_id.to_owned(), connection);
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.inner.read().unwrap().get(client_id).cloned()
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.inner.write().unwrap().remove(client_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    /// Reader-shared iteration.
    pub fn iterate(&self, mut f: impl FnMut(&str, &Arc<Connection>)) {
        let inner = self.inner.read().unwrap();
        for (client_id, connection) in inner.iter() {
            f(client_id, connection);
        }
    }

    /// Atomically empty the table, returning every entry. Holders of the
    /// returned connections are responsible for closing them.
    pub fn drain(&self) -> Vec<(String, Arc<Connection>)> {
        self.inner.write().unwrap().drain().collect()
    }
}

/// In-memory socket for tests/dev.
///
/// [`InMemorySocket::pair`] returns the server-side socket plus a peer
/// handle playing the client: the peer injects inbound frames and observes
/// everything the server writes.
pub struct InMemorySocket {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
}

/// Test-side handle to an [`InMemorySocket`].
pub struct InMemorySocketPeer {
    frames: Option<mpsc::UnboundedSender<String>>,
    writes: mpsc::UnboundedReceiver<String>,
}

impl InMemorySocket {
    pub fn pair() -> (Self, InMemorySocketPeer) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        (
            Self {
                incoming: frame_rx,
                outgoing: write_tx,
            },
            InMemorySocketPeer {
                frames: Some(frame_tx),
                writes: write_rx,
            },
        )
    }
}

impl InMemorySocketPeer {
    /// Inject a frame as if the client had sent it.
    pub fn send_frame(&self, text: impl Into<String>) {
        if let Some(frames) = &self.frames {
            let _ = frames.send(text.into());
        }
    }

    /// Next frame the server wrote to this socket.
    pub async fn next_write(&mut self) -> Option<String> {
        self.writes.recv().await
    }

    pub fn try_next_write(&mut self) -> Option<String> {
        self.writes.try_recv().ok()
    }

    /// Hang up from the client side; the server's read loop sees EOF.
    pub fn close(&mut self) {
        self.frames = None;
    }
}

struct InMemoryStream(mpsc::UnboundedReceiver<String>);

#[async_trait]
impl PacketStream for InMemoryStream {
    async fn next_text(&mut self) -> Option<Result<String, SocketError>> {
        self.0.recv().await.map(Ok)
    }
}

struct InMemorySink(Option<mpsc::UnboundedSender<String>>);

#[async_trait]
impl PacketSink for InMemorySink {
    async fn send_text(&mut self, text: String) -> Result<(), SocketError> {
        match &self.0 {
            Some(tx) => tx.send(text).map_err(|_| SocketError::Closed),
            None => Err(SocketError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), SocketError> {
        self.0 = None;
        Ok(())
    }
}

impl ClientSocket for InMemorySocket {
    fn split(self: Box<Self>) -> (Box<dyn PacketStream>, Box<dyn PacketSink>) {
        (
            Box::new(InMemoryStream(self.incoming)),
            Box::new(InMemorySink(Some(self.outgoing))),
        )
    }
}
