//! Transport configuration.

/// Selects the wire transport used to carry SMB messages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransportConfig {
    /// Direct TCP (port 445), with the 4-byte stream protocol header.
    #[default]
    Tcp,
}
