#![forbid(unsafe_code)]

use std::time::Duration;

pub mod config;
pub mod error;
pub mod tcp;
pub mod traits;

pub use config::*;
pub use error::TransportError;
pub use tcp::{SmbTcpMessageHeader, TcpTransport};
pub use traits::*;

/// Creates [`SmbTransport`] out of [`TransportConfig`].
///
/// ## Arguments
/// * `transport` - The transport configuration to make the transport by.
/// * `timeout` - The timeout duration to use for the transport.
pub fn make_transport(
    transport: &TransportConfig,
    timeout: Duration,
) -> Result<Box<dyn SmbTransport>, TransportError> {
    match transport {
        TransportConfig::Tcp => Ok(Box::new(tcp::TcpTransport::new(timeout))),
    }
}
