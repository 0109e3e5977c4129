//! The client context: configuration, default credentials, the shared
//! transport pool and DFS resolver, and the pluggable collaborator seams
//! (name resolution, wire transport creation, message codec, security
//! provider, DFS referral source).

use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use cifs_transport::{SmbTransport, TransportConfig, TransportError, make_transport};

use crate::auth::{Credentials, SecurityContext, SecurityContextFactory};
use crate::config::ClientConfig;
use crate::dfs::{DfsResolver, NullReferralSource, ReferralSource};
use crate::error::Error;
use crate::msg::{
    MessageBuilder, NegotiateInfo, NegotiateResponse, Request, Response, SessionSetupResponse,
    ShareType, Status, TreeConnectResponse,
};
use crate::transport::TransportPool;
use crate::tree_connection::TreeConnection;
use crate::unc::UncPath;

/// Resolves host names to addresses. NetBIOS resolution is external; the
/// default goes through the platform resolver.
pub trait NameResolver: Send + Sync + fmt::Debug {
    fn resolve(&self, host: &str) -> crate::Result<Vec<IpAddr>>;
}

/// [`NameResolver`] backed by the operating system resolver.
#[derive(Debug, Default)]
pub struct DnsResolver;

impl NameResolver for DnsResolver {
    fn resolve(&self, host: &str) -> crate::Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addrs = (host, 0u16)
            .to_socket_addrs()
            .map_err(|_| Error::UnknownHost(host.to_string()))?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        if ips.is_empty() {
            return Err(Error::UnknownHost(host.to_string()));
        }
        Ok(ips)
    }
}

/// Creates wire transports. Injectable so tests can run over in-memory
/// wires instead of sockets.
pub trait TransportFactory: Send + Sync + fmt::Debug {
    fn create(
        &self,
        config: &TransportConfig,
        timeout: Duration,
    ) -> Result<Box<dyn SmbTransport>, TransportError>;
}

/// The production factory, delegating to [`cifs_transport::make_transport`].
#[derive(Debug, Default)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        config: &TransportConfig,
        timeout: Duration,
    ) -> Result<Box<dyn SmbTransport>, TransportError> {
        make_transport(config, timeout)
    }
}

/// The process-wide client context, shared by every connection it opens.
///
/// Holds the configuration, the default credentials, the transport pool,
/// the DFS referral cache, and the collaborator seams. The message codec
/// and security provider have no useful defaults — install them with
/// [`CifsContext::with_message_builder`] and
/// [`CifsContext::with_security_provider`]; until then any operation that
/// needs them fails with a codec error.
#[derive(Debug)]
pub struct CifsContext {
    config: Arc<ClientConfig>,
    credentials: Credentials,
    pool: Arc<TransportPool>,
    dfs: Arc<DfsResolver>,
    name_resolver: Arc<dyn NameResolver>,
    transport_factory: Arc<dyn TransportFactory>,
    message_builder: Arc<dyn MessageBuilder>,
    security_factory: Arc<dyn SecurityContextFactory>,
    referral_source: Arc<dyn ReferralSource>,
}

impl CifsContext {
    pub fn new(config: ClientConfig, credentials: Credentials) -> CifsContext {
        CifsContext {
            config: Arc::new(config),
            credentials,
            pool: Arc::new(TransportPool::new()),
            dfs: Arc::new(DfsResolver::new()),
            name_resolver: Arc::new(DnsResolver),
            transport_factory: Arc::new(DefaultTransportFactory),
            message_builder: Arc::new(UnconfiguredCodec),
            security_factory: Arc::new(UnconfiguredSecurityProvider),
            referral_source: Arc::new(NullReferralSource),
        }
    }

    pub fn with_message_builder(mut self, builder: Arc<dyn MessageBuilder>) -> Self {
        self.message_builder = builder;
        self
    }

    pub fn with_security_provider(mut self, factory: Arc<dyn SecurityContextFactory>) -> Self {
        self.security_factory = factory;
        self
    }

    pub fn with_referral_source(mut self, source: Arc<dyn ReferralSource>) -> Self {
        self.referral_source = source;
        self
    }

    pub fn with_name_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.name_resolver = resolver;
        self
    }

    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = factory;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn config_arc(&self) -> Arc<ClientConfig> {
        self.config.clone()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn pool(&self) -> &TransportPool {
        &self.pool
    }

    pub fn dfs(&self) -> &DfsResolver {
        &self.dfs
    }

    pub fn name_resolver(&self) -> &dyn NameResolver {
        self.name_resolver.as_ref()
    }

    pub(crate) fn transport_factory(&self) -> Arc<dyn TransportFactory> {
        self.transport_factory.clone()
    }

    pub(crate) fn message_builder(&self) -> Arc<dyn MessageBuilder> {
        self.message_builder.clone()
    }

    pub(crate) fn security_factory(&self) -> Arc<dyn SecurityContextFactory> {
        self.security_factory.clone()
    }

    pub fn referral_source(&self) -> &dyn ReferralSource {
        self.referral_source.as_ref()
    }

    /// Opens a tree connection to the given locator: the exposed
    /// entry point of the connection layer.
    pub fn connect(self: &Arc<Self>, locator: &UncPath) -> crate::Result<Arc<TreeConnection>> {
        let connection = TreeConnection::new(self.clone());
        connection.connect(locator)?;
        Ok(connection)
    }

    /// Shuts the transport pool down. Returns whether any transport was
    /// still in use.
    pub fn close(&self) -> bool {
        self.pool.close()
    }
}

/// Placeholder codec installed until a real one is provided; every message
/// it produces fails at encode/decode time with a descriptive error.
#[derive(Debug, Default)]
struct UnconfiguredCodec;

#[derive(Debug)]
struct UnconfiguredRequest;

#[derive(Debug)]
struct UnconfiguredResponse;

impl Request for UnconfiguredRequest {
    fn encode(&self) -> crate::Result<Vec<u8>> {
        Err(Error::Codec("no message codec configured".to_string()))
    }

    fn reset(&mut self) {}

    fn set_session_id(&mut self, _session_id: u64) {}

    fn set_tree_id(&mut self, _tree_id: u32) {}
}

impl Response for UnconfiguredResponse {
    fn decode(&mut self, _bytes: &[u8]) -> crate::Result<()> {
        Err(Error::Codec("no message codec configured".to_string()))
    }

    fn reset(&mut self) {}

    fn status(&self) -> Status {
        Status::SUCCESS
    }

    fn is_received(&self) -> bool {
        false
    }
}

impl NegotiateResponse for UnconfiguredResponse {
    fn info(&self) -> crate::Result<NegotiateInfo> {
        Err(Error::Codec("no message codec configured".to_string()))
    }
}

impl SessionSetupResponse for UnconfiguredResponse {
    fn session_id(&self) -> u64 {
        0
    }

    fn security_token(&self) -> &[u8] {
        &[]
    }
}

impl TreeConnectResponse for UnconfiguredResponse {
    fn tree_id(&self) -> u32 {
        0
    }

    fn share_type(&self) -> ShareType {
        ShareType::Disk
    }

    fn is_dfs(&self) -> bool {
        false
    }
}

impl MessageBuilder for UnconfiguredCodec {
    fn negotiate(
        &self,
        _config: &ClientConfig,
        _client_guid: [u8; 16],
    ) -> (Box<dyn Request>, Box<dyn NegotiateResponse>) {
        (Box::new(UnconfiguredRequest), Box::new(UnconfiguredResponse))
    }

    fn session_setup(
        &self,
        _security_token: &[u8],
    ) -> (Box<dyn Request>, Box<dyn SessionSetupResponse>) {
        (Box::new(UnconfiguredRequest), Box::new(UnconfiguredResponse))
    }

    fn tree_connect(&self, _unc_share: &str) -> (Box<dyn Request>, Box<dyn TreeConnectResponse>) {
        (Box::new(UnconfiguredRequest), Box::new(UnconfiguredResponse))
    }

    fn tree_disconnect(&self) -> (Box<dyn Request>, Box<dyn Response>) {
        (Box::new(UnconfiguredRequest), Box::new(UnconfiguredResponse))
    }

    fn logoff(&self) -> (Box<dyn Request>, Box<dyn Response>) {
        (Box::new(UnconfiguredRequest), Box::new(UnconfiguredResponse))
    }
}

/// Placeholder security provider; fails context creation until replaced.
#[derive(Debug, Default)]
struct UnconfiguredSecurityProvider;

impl SecurityContextFactory for UnconfiguredSecurityProvider {
    fn create(
        &self,
        _mechanism: crate::auth::Mechanism,
        _credentials: &Credentials,
        _target_host: &str,
    ) -> crate::Result<Box<dyn SecurityContext>> {
        Err(Error::Authentication(
            "no security provider configured".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_resolver_accepts_literals() {
        let resolver = DnsResolver;
        let addrs = resolver.resolve("192.0.2.7").unwrap();
        assert_eq!(addrs, vec!["192.0.2.7".parse::<IpAddr>().unwrap()]);

        let addrs = resolver.resolve("::1").unwrap();
        assert_eq!(addrs.len(), 1);
    }

    #[test]
    fn test_unconfigured_codec_fails_cleanly() {
        let codec = UnconfiguredCodec;
        let (req, _resp) = codec.negotiate(&ClientConfig::default(), [0u8; 16]);
        assert!(matches!(req.encode(), Err(Error::Codec(_))));
    }
}
