//! Axum WebSocket upgrade path.
//!
//! The upgrade handler calls [`Messenger::attach`] directly: the socket
//! seam is part of the messenger's own surface, so no downcasting to a
//! concrete implementation is ever needed.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

use crate::connection::{ClientSocket, PacketSink, PacketStream, SocketError};
use crate::messenger::Messenger;

/// Router exposing `GET /ws/:client_id` for WebSocket attachment.
pub fn router(messenger: Arc<Messenger>) -> Router {
    Router::new()
        .route("/ws/:client_id", get(upgrade))
        .with_state(messenger)
}

async fn upgrade(
    State(messenger): State<Arc<Messenger>>,
    Path(client_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = messenger
            .attach(&client_id, Box::new(WsSocket::new(socket)))
            .await
        {
            debug!(client_id = %client_id, error = %e, "failed to attach websocket client");
        }
    })
}

/// [`ClientSocket`] over an axum WebSocket.
pub struct WsSocket {
    socket: WebSocket,
}

impl WsSocket {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl ClientSocket for WsSocket {
    fn split(self: Box<Self>) -> (Box<dyn PacketStream>, Box<dyn PacketSink>) {
        let (sink, stream) = self.socket.split();
        (Box::new(WsStream(stream)), Box::new(WsSink(sink)))
    }
}

struct WsStream(SplitStream<WebSocket>);

#[async_trait]
impl PacketStream for WsStream {
    async fn next_text(&mut self) -> Option<Result<String, SocketError>> {
        loop {
            return match self.0.next().await {
                None => None,
                Some(Err(e)) => Some(Err(SocketError::Io(e.to_string()))),
                Some(Ok(Message::Text(text))) => Some(Ok(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Some(Ok(Message::Close(_))) => None,
                // Control frames are transport noise, not packets.
                Some(Ok(_)) => continue,
            };
        }
    }
}

struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl PacketSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), SocketError> {
        self.0
            .send(Message::Text(text))
            .await
            .map_err(|e| SocketError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SocketError> {
        self.0
            .close()
            .await
            .map_err(|e| SocketError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use fleetlink_bus::{InMemoryBroker, InMemoryEventBus};

    #[tokio::test]
    async fn router_wires_the_upgrade_route() {
        let broker = InMemoryBroker::new();
        let messenger = Messenger::start(
            "r1",
            Arc::new(InMemoryDirectory::new()),
            Arc::new(InMemoryEventBus::new(broker)),
        );
        let app = router(messenger);
        assert!(app.has_routes());
    }
}
