//! Trait for the pluggable overlay transport.
//!
//! Main trait: [`Overlay`]. The concrete dialing/discovery library is a collaborator; the
//! core only needs the operations below. Implementations must deliver chunks from a single
//! connection in arrival order.

use std::fmt::{self, Display, Formatter};

use crate::peers::Peer;
use crate::types::data_types::ConnectionId;

/// Trait for the pluggable overlay transport.
pub trait Overlay: Clone + Send + 'static {
    /// Send raw bytes to the specified connection without blocking.
    fn send(&mut self, conn: ConnectionId, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Send raw bytes to every live connection without blocking.
    fn broadcast(&mut self, bytes: Vec<u8>);

    /// Tear down one connection.
    fn disconnect(&mut self, conn: ConnectionId);

    /// (Re)start walking the overlay for new peers.
    fn start_discovery(&mut self);

    /// Stop walking the overlay for new peers.
    fn stop_discovery(&mut self);

    /// Receive the next input from the overlay. Returns immediately with `None` if nothing
    /// is available now.
    fn recv(&mut self) -> Option<OverlayInput>;
}

/// One input delivered by the overlay transport.
pub enum OverlayInput {
    /// A chunk of bytes from a live connection. Chunk boundaries are transport artifacts;
    /// reassembly into messages is the protocol engine's job.
    Chunk { conn: ConnectionId, bytes: Vec<u8> },
    /// A connection to `peer` was established.
    Connected { conn: ConnectionId, peer: Peer },
    /// The connection was torn down, by either side.
    Disconnected { conn: ConnectionId },
    /// Discovery surfaced a peer that can be dialed.
    Discovered { peer: Peer },
}

/// Error reported by the overlay transport.
#[derive(Debug)]
pub enum TransportError {
    /// The connection is gone; the peer disconnected mid-frame or was torn down.
    ConnectionClosed(ConnectionId),
    /// A dial could not be completed.
    DialFailed(String),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionClosed(conn) => {
                write!(f, "connection {} is closed", conn)
            }
            TransportError::DialFailed(addr) => write!(f, "failed to dial {}", addr),
        }
    }
}
