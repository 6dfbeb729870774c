//! The messenger: composes the event bus, the global directory, and the
//! local connection table to deliver an [`OutPacket`] to a client no
//! matter which replica it is attached to.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tracing::{debug, error, info, warn};

use fleetlink_bus::{EventBus, EventHandler};

use crate::connection::{ClientSocket, Connection, LocalConnections, PacketStream};
use crate::directory::{ConnectionInfo, Directory, DirectoryError};
use crate::packet::{OutPacket, Packet};

const MAX_SUBSCRIBE_RETRIES: usize = 5;
const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Messenger error.
#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Application-level handler for inbound packets.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, packet: Packet);
}

/// [`MessageHandler`] built from an async closure.
pub struct FnMessageHandler {
    inner: Box<dyn Fn(Packet) -> BoxFuture<'static, ()> + Send + Sync>,
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn message_handler_fn<F, Fut>(f: F) -> FnMessageHandler
where
    F: Fn(Packet) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    FnMessageHandler {
        inner: Box::new(move |packet| Box::pin(f(packet))),
    }
}

#[async_trait]
impl MessageHandler for FnMessageHandler {
    async fn handle(&self, packet: Packet) {
        (self.inner)(packet).await
    }
}

/// Realtime messenger for one replica.
pub struct Messenger {
    server_id: String,
    connections: LocalConnections,
    directory: Arc<dyn Directory>,
    bus: Arc<dyn EventBus>,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl Messenger {
    /// Create the messenger and subscribe it to its own `server_id` topic
    /// (retrying in the background), so other replicas can route packets
    /// here.
    pub fn start(
        server_id: impl Into<String>,
        directory: Arc<dyn Directory>,
        bus: Arc<dyn EventBus>,
    ) -> Arc<Self> {
        let messenger = Arc::new(Self {
            server_id: server_id.into(),
            connections: LocalConnections::new(),
            directory,
            bus,
            handlers: RwLock::new(HashMap::new()),
        });

        let subscriber = messenger.clone();
        tokio::spawn(async move {
            subscriber.subscribe_with_retry().await;
        });
        messenger
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn subscribe_with_retry(self: Arc<Self>) {
        for attempt in 1..=MAX_SUBSCRIBE_RETRIES {
            match self.bus.subscribe(&self.server_id, self.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        server_id = %self.server_id,
                        attempt,
                        error = %e,
                        "failed to subscribe to own topic"
                    );
                    tokio::time::sleep(SUBSCRIBE_RETRY_DELAY).await;
                }
            }
        }
        error!(server_id = %self.server_id, "giving up on topic subscription; cross-server delivery is down");
    }

    /// Register an application-level handler for inbound packets with the
    /// given event name. Handlers run off the read loop, so a slow handler
    /// cannot block reads.
    pub fn listen<H>(&self, event_name: &str, handler: H)
    where
        H: MessageHandler + 'static,
    {
        self.handlers
            .write()
            .unwrap()
            .insert(event_name.to_owned(), Arc::new(handler));
    }

    /// Attach a client socket: register it in the directory and the local
    /// table, then start its read loop. On a directory failure the socket
    /// is not registered at all.
    pub async fn attach(
        self: &Arc<Self>,
        client_id: &str,
        socket: Box<dyn ClientSocket>,
    ) -> Result<(), MessengerError> {
        let (stream, sink) = socket.split();

        self.directory
            .put(&ConnectionInfo {
                client_id: client_id.to_owned(),
                server_id: self.server_id.clone(),
            })
            .await?;

        let connection = Arc::new(Connection::new(client_id.to_owned(), sink));
        self.connections.put(client_id, connection.clone());

        let messenger = self.clone();
        tokio::spawn(async move {
            messenger.read_loop(stream, connection).await;
        });

        debug!(client_id, server_id = %self.server_id, "client attached");
        Ok(())
    }

    /// Deliver a packet to its receiver, wherever the receiver is
    /// attached. Invalid packets and packets for offline receivers are
    /// dropped silently.
    pub async fn send(&self, packet: &OutPacket) {
        if !packet.is_valid() {
            debug!("dropping invalid outgoing packet");
            return;
        }

        if let Some(connection) = self.connections.get(&packet.receiver) {
            // Receiver is online on this replica.
            self.push_packet(&connection, packet).await;
            return;
        }

        match self.directory.get(&packet.receiver).await {
            Ok(Some(info)) => {
                // Receiver is online on another replica.
                if let Ok(data) = serde_json::to_string(packet) {
                    if let Err(e) = self.bus.publish(&info.server_id, &data).await {
                        warn!(receiver = %packet.receiver, error = %e, "cross-server publish failed");
                    }
                }
            }
            Ok(None) => {
                // Receiver is offline.
            }
            Err(e) => {
                warn!(receiver = %packet.receiver, error = %e, "directory lookup failed");
            }
        }
    }

    /// Delete the directory entries for every locally-attached client and
    /// close their sockets.
    pub async fn teardown(&self) {
        let mut client_ids = Vec::new();
        self.connections
            .iterate(|client_id, _| client_ids.push(client_id.to_owned()));
        info!(
            server_id = %self.server_id,
            connections = client_ids.len(),
            "tearing down messenger client connections"
        );

        if let Err(e) = self.directory.remove_all(&client_ids).await {
            warn!(error = %e, "failed to clear directory entries on teardown");
        }

        for (_, connection) in self.connections.drain() {
            connection.close().await;
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: Box<dyn PacketStream>, conn: Arc<Connection>) {
        loop {
            let frame = match stream.next_text().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!(client_id = %conn.client_id(), error = %e, "socket read failed");
                    self.detach(conn.client_id()).await;
                    return;
                }
                None => {
                    debug!(client_id = %conn.client_id(), "socket closed by peer");
                    self.detach(conn.client_id()).await;
                    return;
                }
            };

            let packet: Packet = match serde_json::from_str(&frame) {
                Ok(packet) => packet,
                Err(_) => {
                    debug!(client_id = %conn.client_id(), "packet parsing error");
                    continue;
                }
            };
            if !packet.is_valid() {
                continue;
            }

            let handler = self.handlers.read().unwrap().get(&packet.event_name).cloned();
            if let Some(handler) = handler {
                tokio::spawn(async move {
                    handler.handle(packet).await;
                });
            }
        }
    }

    async fn detach(&self, client_id: &str) {
        if let Err(e) = self.directory.remove(client_id).await {
            warn!(client_id, error = %e, "failed to remove directory entry");
        }
        if let Some(connection) = self.connections.remove(client_id) {
            connection.close().await;
        }
    }

    async fn push_packet(&self, connection: &Connection, packet: &OutPacket) {
        let Ok(data) = serde_json::to_string(packet) else {
            return;
        };
        if let Err(e) = connection.send_text(data).await {
            debug!(client_id = %connection.client_id(), error = %e, "socket write failed");
        }
    }
}

#[async_trait]
impl EventHandler for Messenger {
    /// Inbound from the bus: a packet routed here because the directory
    /// says the receiver is ours. If the client detached in the meantime,
    /// the packet is dropped (connection churn race).
    async fn handle(&self, _topic: &str, payload: &str) {
        let Ok(packet) = serde_json::from_str::<OutPacket>(payload) else {
            return;
        };
        if let Some(connection) = self.connections.get(&packet.receiver) {
            self.push_packet(&connection, &packet).await;
        }
    }
}
