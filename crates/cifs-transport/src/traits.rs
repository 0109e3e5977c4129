//! Common traits for wire transports.

use std::net::SocketAddr;

use crate::TransportError;

/// A message-oriented, blocking wire transport carrying SMB messages.
///
/// A transport owns exactly one underlying connection. All calls that touch
/// the wire block the calling thread, bounded by the transport's configured
/// timeout; callers requiring ordering must serialize access themselves.
pub trait SmbTransport: Send + std::fmt::Debug {
    /// Establishes the connection to the remote peer.
    fn connect(&mut self, remote: SocketAddr) -> Result<(), TransportError>;

    /// Whether the transport currently holds a usable connection.
    fn is_connected(&self) -> bool;

    /// Sends one whole message, including any framing the transport adds.
    fn send(&mut self, message: &[u8]) -> Result<(), TransportError>;

    /// Receives one whole message, stripped of transport framing.
    fn receive(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Tears the connection down. Idempotent.
    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// The address of the remote peer, if connected.
    fn remote_addr(&self) -> Option<SocketAddr>;
}
