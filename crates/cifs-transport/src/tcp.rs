//! Direct TCP transport (MS-SMB2 2.1 transport, port 445).

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use crate::{SmbTransport, TransportError};

/// The 4-byte stream protocol header preceding each SMB message on direct
/// TCP: a zero byte followed by a 24-bit big-endian payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmbTcpMessageHeader {
    pub stream_protocol_length: u32,
}

impl SmbTcpMessageHeader {
    pub const SIZE: usize = 4;

    /// Largest payload the 24-bit length field can describe.
    pub const MAX_MESSAGE_SIZE: usize = 0x00FF_FFFF;

    pub fn new(length: u32) -> Self {
        Self {
            stream_protocol_length: length,
        }
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let len = self.stream_protocol_length.to_be_bytes();
        [0, len[1], len[2], len[3]]
    }

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Result<Self, TransportError> {
        if bytes[0] != 0 {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid stream protocol header",
            )));
        }
        Ok(Self {
            stream_protocol_length: u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]),
        })
    }
}

/// Blocking TCP implementation of [`SmbTransport`].
///
/// All socket operations are bounded by the timeout given at construction,
/// applied to connect, read and write alike.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> TcpTransport {
        TcpTransport {
            stream: None,
            timeout,
        }
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }

    /// Maps blocking-I/O timeouts onto [`TransportError::Timeout`] so the
    /// caller sees one error kind for every expired deadline.
    fn map_io(&self, e: std::io::Error) -> TransportError {
        match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                TransportError::Timeout(self.timeout)
            }
            std::io::ErrorKind::UnexpectedEof => TransportError::ConnectionClosed,
            _ => TransportError::Io(e),
        }
    }
}

impl SmbTransport for TcpTransport {
    fn connect(&mut self, remote: SocketAddr) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        log::debug!("Connecting to {remote}");

        let stream =
            TcpStream::connect_timeout(&remote, self.timeout).map_err(|e| self.map_io(e))?;

        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;

        self.stream = Some(stream);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn send(&mut self, message: &[u8]) -> Result<(), TransportError> {
        if message.len() > SmbTcpMessageHeader::MAX_MESSAGE_SIZE {
            return Err(TransportError::FrameTooLarge(message.len()));
        }
        let header = SmbTcpMessageHeader::new(message.len() as u32).to_bytes();
        let timeout = self.timeout;
        let stream = self.stream_mut()?;

        let result = stream
            .write_all(&header)
            .and_then(|_| stream.write_all(message))
            .and_then(|_| stream.flush());
        result.map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                TransportError::Timeout(timeout)
            }
            _ => TransportError::Io(e),
        })?;

        log::trace!("Sent message of {} bytes", message.len());
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        let timeout = self.timeout;
        let stream = self.stream_mut()?;

        let mut header = [0u8; SmbTcpMessageHeader::SIZE];
        read_exact_mapped(stream, &mut header, timeout)?;
        let header = SmbTcpMessageHeader::from_bytes(header)?;

        let mut payload = vec![0u8; header.stream_protocol_length as usize];
        read_exact_mapped(stream, &mut payload, timeout)?;

        log::trace!("Received message of {} bytes", payload.len());
        Ok(payload)
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(stream) = self.stream.take() {
            log::debug!("Disconnecting from {:?}", stream.peer_addr().ok());
            // Errors on shutdown of an already-dead socket are not interesting.
            let _ = stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }
}

fn read_exact_mapped(
    stream: &mut TcpStream,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), TransportError> {
    stream.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            TransportError::Timeout(timeout)
        }
        std::io::ErrorKind::UnexpectedEof => TransportError::ConnectionClosed,
        _ => TransportError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_header_roundtrip() {
        let header = SmbTcpMessageHeader::new(0x0001_0203);
        let bytes = header.to_bytes();
        assert_eq!(bytes, [0x00, 0x01, 0x02, 0x03]);
        assert_eq!(SmbTcpMessageHeader::from_bytes(bytes).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_nonzero_type() {
        assert!(SmbTcpMessageHeader::from_bytes([1, 0, 0, 4]).is_err());
    }

    #[test_log::test]
    fn test_send_receive_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let echo = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut header = [0u8; 4];
            socket.read_exact(&mut header).unwrap();
            let len = SmbTcpMessageHeader::from_bytes(header)
                .unwrap()
                .stream_protocol_length as usize;
            let mut payload = vec![0u8; len];
            socket.read_exact(&mut payload).unwrap();
            socket.write_all(&header).unwrap();
            socket.write_all(&payload).unwrap();
        });

        let mut transport = TcpTransport::new(Duration::from_secs(5));
        transport.connect(addr).unwrap();
        assert!(transport.is_connected());

        transport.send(b"\xfeSMB-test-payload").unwrap();
        let received = transport.receive().unwrap();
        assert_eq!(received, b"\xfeSMB-test-payload");

        transport.disconnect().unwrap();
        assert!(!transport.is_connected());
        echo.join().unwrap();
    }

    #[test]
    fn test_receive_on_closed_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            // Accept and immediately drop the socket.
            let _ = listener.accept().unwrap();
        });

        let mut transport = TcpTransport::new(Duration::from_secs(5));
        transport.connect(addr).unwrap();
        server.join().unwrap();

        match transport.receive() {
            Err(TransportError::ConnectionClosed) | Err(TransportError::Io(_)) => {}
            other => panic!("expected a connection error, got {other:?}"),
        }
    }

    #[test]
    fn test_send_without_connect() {
        let mut transport = TcpTransport::new(Duration::from_secs(1));
        assert!(matches!(
            transport.send(b"x"),
            Err(TransportError::NotConnected)
        ));
    }
}
