//! Error types for the connection layer.

use crate::msg::Status;
use cifs_transport::TransportError;

/// The error type for SMB client operations.
///
/// Variants fall into four classes with distinct handling:
/// * connectivity ([`Error::Transport`], [`Error::ConnectionFailed`]) —
///   eligible for reconnect-and-retry at the tree-connection level;
/// * protocol status ([`Error::ServerError`]) — a valid answer from a live
///   server, returned to the caller as-is and never retried;
/// * authentication ([`Error::Authentication`],
///   [`Error::UnsupportedOperation`]) — fail fast, never retried;
/// * misuse ([`Error::InvalidState`], [`Error::InvalidArgument`]) — caller
///   bugs surfaced immediately. Reference-count underflow is not an error
///   value at all: it panics.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A wire-level failure on an established connection.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Could not establish a connection to the given endpoint.
    #[error("connection to {host}:{port} failed: {source}")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: TransportError,
    },

    /// Host name did not resolve to any address.
    #[error("unknown host: {0}")]
    UnknownHost(String),

    /// The server answered with an error status.
    #[error("server returned status {0}")]
    ServerError(Status),

    /// Authentication or mechanism negotiation failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The requested operation is not supported in the current setup.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The object is not in a state that allows the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Malformed caller input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The message codec failed to encode or decode a message.
    #[error("message codec error: {0}")]
    Codec(String),
}

impl Error {
    /// Whether the failure happened below the SMB protocol, making the
    /// request eligible for a reconnect-and-resend.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::ConnectionFailed { .. } | Error::UnknownHost(_)
        )
    }

    /// The server status carried by this error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::ServerError(status) => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Transport(TransportError::ConnectionClosed).is_retryable());
        assert!(
            Error::ConnectionFailed {
                host: "srv".into(),
                port: 445,
                source: TransportError::NotConnected,
            }
            .is_retryable()
        );
        assert!(!Error::ServerError(Status::ACCESS_DENIED).is_retryable());
        assert!(!Error::Authentication("bad password".into()).is_retryable());
        assert!(!Error::InvalidState("not connected".into()).is_retryable());
    }

    #[test]
    fn test_status_accessor() {
        assert_eq!(
            Error::ServerError(Status::LOGON_FAILURE).status(),
            Some(Status::LOGON_FAILURE)
        );
        assert_eq!(Error::Authentication("x".into()).status(), None);
    }
}
