//! `fleetlink-messenger` — cross-server realtime messaging.
//!
//! Persistent client sockets terminate on whichever replica the client
//! chose. A shared directory maps each client to its owning replica, and
//! messages for clients attached elsewhere are routed over the event bus
//! using the owner's `server_id` as the topic.

pub mod connection;
pub mod directory;
pub mod messenger;
pub mod packet;
pub mod ws;

pub use connection::{
    ClientSocket, Connection, InMemorySocket, InMemorySocketPeer, LocalConnections, PacketSink,
    PacketStream, SocketError,
};
pub use directory::{ConnectionInfo, Directory, DirectoryError, InMemoryDirectory, RedisDirectory};
pub use messenger::{
    message_handler_fn, FnMessageHandler, MessageHandler, Messenger, MessengerError,
};
pub use packet::{OutPacket, Packet};
