//! Client configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::msg::Dialect;

/// Default direct-TCP port for SMB.
pub const DEFAULT_PORT: u16 = 445;

/// Configuration for a client context.
///
/// All values have sensible defaults; construct with struct-update syntax:
/// ```
/// use cifs::ClientConfig;
/// let config = ClientConfig {
///     max_request_retries: 1,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Lowest dialect revision the client will accept.
    pub min_dialect: Dialect,
    /// Highest dialect revision the client will offer.
    pub max_dialect: Dialect,

    /// Port to connect to when the locator names none.
    pub port: u16,
    /// Local address to bind outgoing connections to. Participates in
    /// transport pool identity.
    pub local_addr: Option<SocketAddr>,

    /// Deadline applied to every blocking network call.
    pub timeout: Duration,

    /// Whether this client requires message signing on every connection.
    pub signing_enforced: bool,

    /// How many times a request may be replayed after a transport-level
    /// failure. Total attempts are `max_request_retries + 1`.
    pub max_request_retries: u32,

    /// Caps the number of sessions multiplexed on one transport.
    /// Zero means unlimited; 1 effectively disables transport sharing.
    pub session_limit: u32,

    pub dfs: DfsConfig,
    pub auth: AuthConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            min_dialect: Dialect::MIN,
            max_dialect: Dialect::MAX,
            port: DEFAULT_PORT,
            local_addr: None,
            timeout: Duration::from_secs(30),
            signing_enforced: false,
            max_request_retries: 2,
            session_limit: 0,
            dfs: DfsConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

/// DFS referral handling configuration.
#[derive(Debug, Clone)]
pub struct DfsConfig {
    /// When disabled, every resolution short-circuits to "no referral"
    /// without touching the network.
    pub enabled: bool,
    /// Lifetime of cached referrals. Referral responses carrying their own
    /// time-to-live override this.
    pub ttl: Duration,
}

impl Default for DfsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
        }
    }
}

/// Authentication mechanism policy.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Whether Kerberos credentials may fall back to NTLM when the server
    /// does not advertise a Kerberos mechanism.
    pub allow_ntlm_fallback: bool,
    /// Use raw NTLMSSP without the SPNEGO wrapper.
    pub use_raw_ntlm: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_ntlm_fallback: true,
            use_raw_ntlm: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.min_dialect, Dialect::Smb1);
        assert_eq!(config.max_dialect, Dialect::Smb0311);
        assert!(config.dfs.enabled);
        assert!(config.auth.allow_ntlm_fallback);
        assert!(!config.signing_enforced);
        assert!(config.max_request_retries >= 1);
    }
}
