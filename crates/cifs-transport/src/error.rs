//! Transport-level errors.
//!
//! Everything in here is a *connectivity* failure: the peer was unreachable,
//! the connection dropped, or an I/O deadline expired. Upper layers treat
//! these as candidates for reconnect-and-retry, in contrast to SMB status
//! codes returned by a live server.

use std::io;

/// An error raised by a wire transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport is not connected")]
    NotConnected,

    #[error("transport is already connected")]
    AlreadyConnected,

    #[error("connection closed by remote peer")]
    ConnectionClosed,

    #[error("message of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
}

impl TransportError {
    /// Whether this error indicates the connection is no longer usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::AlreadyConnected)
    }
}
