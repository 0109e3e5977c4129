//! Physical connection management: the negotiated [`Transport`] and the
//! process-wide [`TransportPool`].

pub mod pool;
pub mod preauth_hash;

pub use pool::TransportPool;
pub use preauth_hash::{
    PREAUTH_HASH_SIZE, PreauthHashState, PreauthHashValue, calculate_preauth_hash,
};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rand::RngCore;
use rand::rngs::OsRng;

use cifs_transport::{SmbTransport, TransportConfig, TransportError};

use crate::config::ClientConfig;
use crate::context::{CifsContext, TransportFactory};
use crate::error::Error;
use crate::msg::{Dialect, MessageBuilder, NegotiateInfo, Request, Response, Status};
use crate::session::Session;

/// Lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
}

impl TransportState {
    fn from_u8(value: u8) -> TransportState {
        match value {
            0 => TransportState::Disconnected,
            1 => TransportState::Connecting,
            2 => TransportState::Connected,
            _ => TransportState::Failed,
        }
    }
}

/// Whether an exchange folds its bytes into the pre-auth integrity chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PreauthFold {
    No,
    /// Session-setup round: the request is always folded; the response
    /// only while the server keeps answering MORE_PROCESSING_REQUIRED.
    SessionSetup,
}

#[derive(Debug)]
struct TransportInner {
    wire: Option<Box<dyn SmbTransport>>,
    negotiated: Option<NegotiateInfo>,
    preauth: PreauthHashState,
}

/// One physical connection plus its negotiated SMB state, shared by any
/// number of sessions and reference-counted by explicit
/// [`acquire`](Transport::acquire)/[`release`](Transport::release) pairs.
///
/// All wire I/O is serialized by an internal lock, which also gives
/// pre-auth hash updates their strict total order. Lifecycle state and the
/// signing policy are kept in atomics so the pool can inspect candidates
/// without touching that lock.
#[derive(Debug)]
pub struct Transport {
    host: String,
    addr: SocketAddr,
    port: u16,
    local_addr: Option<SocketAddr>,
    force_signing: bool,
    client_guid: [u8; 16],

    config: Arc<ClientConfig>,
    factory: Arc<dyn TransportFactory>,
    builder: Arc<dyn MessageBuilder>,

    usage: AtomicIsize,
    state: AtomicU8,
    /// Signing the server demanded in negotiate.
    signing_required: AtomicBool,
    /// Signing this transport guarantees (client-forced or server-required).
    signing_enforced: AtomicBool,

    inner: Mutex<TransportInner>,
    sessions: Mutex<Vec<Weak<Session>>>,
}

impl Transport {
    /// Creates a transport in the `Disconnected` state, counted as one
    /// outstanding acquisition (the reference handed to the creator).
    pub(crate) fn new(
        ctx: &CifsContext,
        host: &str,
        addr: SocketAddr,
        port: u16,
        force_signing: bool,
    ) -> Transport {
        let mut client_guid = [0u8; 16];
        OsRng.fill_bytes(&mut client_guid);

        Transport {
            host: host.to_string(),
            addr,
            port,
            local_addr: ctx.config().local_addr,
            force_signing,
            client_guid,
            config: ctx.config_arc(),
            factory: ctx.transport_factory(),
            builder: ctx.message_builder(),
            usage: AtomicIsize::new(1),
            state: AtomicU8::new(TransportState::Disconnected as u8),
            signing_required: AtomicBool::new(false),
            signing_enforced: AtomicBool::new(force_signing),
            inner: Mutex::new(TransportInner {
                wire: None,
                negotiated: None,
                preauth: PreauthHashState::Unsupported,
            }),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether this transport is the one identified by (host, port, local
    /// bind). Host comparison is case-insensitive.
    pub fn matches(&self, host: &str, port: u16, local_addr: Option<SocketAddr>) -> bool {
        self.host.eq_ignore_ascii_case(host) && self.port == port && self.local_addr == local_addr
    }

    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    pub fn is_failed(&self) -> bool {
        self.state() == TransportState::Failed
    }

    /// Signing guarantee of this transport, as fixed at creation (forced)
    /// or by the negotiate exchange (server-required).
    pub fn signing_enforced(&self) -> bool {
        self.signing_enforced.load(Ordering::SeqCst)
    }

    /// Whether the *server* required signing in negotiate.
    pub fn signing_required_by_server(&self) -> bool {
        self.signing_required.load(Ordering::SeqCst)
    }

    pub fn in_use(&self) -> bool {
        self.usage.load(Ordering::SeqCst) > 0
    }

    pub fn usage_count(&self) -> isize {
        self.usage.load(Ordering::SeqCst)
    }

    /// Takes another reference to this transport.
    pub fn acquire(self: &Arc<Self>) -> Arc<Transport> {
        let usage = self.usage.fetch_add(1, Ordering::SeqCst) + 1;
        log::trace!("Acquire transport {} ({usage})", self.host);
        self.clone()
    }

    /// Releases one reference. Reaching zero disconnects the transport;
    /// releasing past zero is a programming error and panics.
    pub fn release(&self) {
        let usage = self.usage.fetch_sub(1, Ordering::SeqCst) - 1;
        log::trace!("Release transport {} ({usage})", self.host);

        if usage < 0 {
            panic!("Transport usage count dropped below zero");
        }
        if usage > 0 {
            return;
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // An acquirer may have raced in between the decrement and the lock.
        if self.usage.load(Ordering::SeqCst) != 0 {
            return;
        }
        log::debug!("Usage dropped to zero, disconnecting transport {}", self.host);
        self.disconnect_locked(&mut inner);
    }

    /// Tears the wire connection down, discarding all negotiated state.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.disconnect_locked(&mut inner);
    }

    fn disconnect_locked(&self, inner: &mut TransportInner) {
        if let Some(mut wire) = inner.wire.take() {
            let _ = wire.disconnect();
        }
        inner.negotiated = None;
        inner.preauth = PreauthHashState::Unsupported;
        if self.state() != TransportState::Failed {
            self.state
                .store(TransportState::Disconnected as u8, Ordering::SeqCst);
        }
    }

    fn mark_failed_locked(&self, inner: &mut TransportInner) {
        if let Some(mut wire) = inner.wire.take() {
            let _ = wire.disconnect();
        }
        inner.negotiated = None;
        inner.preauth = PreauthHashState::Unsupported;
        self.state
            .store(TransportState::Failed as u8, Ordering::SeqCst);
    }

    /// Connects and performs the one-time negotiate handshake. Idempotent;
    /// concurrent callers serialize on the wire lock and the laggards find
    /// the connection established.
    pub fn ensure_connected(&self) -> crate::Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match self.state() {
            TransportState::Connected => return Ok(()),
            TransportState::Failed => {
                return Err(Error::InvalidState(format!(
                    "transport to {} has failed and must be replaced",
                    self.host
                )));
            }
            _ => {}
        }

        self.state
            .store(TransportState::Connecting as u8, Ordering::SeqCst);

        let connect_result = self
            .factory
            .create(&TransportConfig::Tcp, self.config.timeout)
            .and_then(|mut wire| wire.connect(self.addr).map(|_| wire));
        let wire = match connect_result {
            Ok(wire) => wire,
            Err(source) => {
                self.mark_failed_locked(&mut inner);
                return Err(Error::ConnectionFailed {
                    host: self.host.clone(),
                    port: self.port,
                    source,
                });
            }
        };
        inner.wire = Some(wire);

        if let Err(e) = self.negotiate_locked(&mut inner) {
            log::warn!("Negotiate with {} failed: {e}", self.host);
            self.mark_failed_locked(&mut inner);
            return Err(e);
        }

        self.state
            .store(TransportState::Connected as u8, Ordering::SeqCst);
        Ok(())
    }

    fn negotiate_locked(&self, inner: &mut TransportInner) -> crate::Result<()> {
        let (req, mut resp) = self.builder.negotiate(&self.config, self.client_guid);
        let sent = req.encode()?;

        let wire = inner
            .wire
            .as_mut()
            .ok_or(Error::Transport(TransportError::NotConnected))?;
        wire.send(&sent)?;
        let received = wire.receive()?;
        resp.decode(&received)?;

        if resp.status().is_error() {
            return Err(Error::ServerError(resp.status()));
        }

        let info = resp.info()?;
        if info.dialect < self.config.min_dialect || info.dialect > self.config.max_dialect {
            return Err(Error::InvalidState(format!(
                "server negotiated dialect {:?} outside the configured range",
                info.dialect
            )));
        }

        self.signing_required
            .store(info.signing_required, Ordering::SeqCst);
        self.signing_enforced.store(
            self.force_signing || self.config.signing_enforced || info.signing_required,
            Ordering::SeqCst,
        );

        // The negotiate exchange itself opens the 3.1.1 integrity chain.
        inner.preauth = if info.dialect.has_preauth_integrity() {
            PreauthHashState::begin().next(&sent).next(&received)
        } else {
            PreauthHashState::Unsupported
        };

        log::info!(
            "Negotiated dialect {:?} with {} (signing required: {})",
            info.dialect,
            self.host,
            info.signing_required
        );
        inner.negotiated = Some(info);
        Ok(())
    }

    /// The state fixed by negotiate.
    pub fn negotiate_info(&self) -> crate::Result<NegotiateInfo> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .negotiated
            .clone()
            .ok_or_else(|| Error::InvalidState("transport has not negotiated yet".to_string()))
    }

    pub fn dialect(&self) -> Option<Dialect> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.negotiated.as_ref().map(|info| info.dialect)
    }

    /// Folds one message into the pre-auth integrity chain.
    ///
    /// Only valid on a 3.1.1 connection with a live chain; updates are
    /// totally ordered by the wire lock. A mis-sequenced update poisons
    /// the chain, and the connection must renegotiate before further use.
    pub fn update_preauth_hash(&self, data: &[u8]) -> crate::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.update_preauth_locked(&mut inner, data)
    }

    fn update_preauth_locked(
        &self,
        inner: &mut TransportInner,
        data: &[u8],
    ) -> crate::Result<()> {
        match &inner.preauth {
            PreauthHashState::Unsupported => {
                return Err(Error::InvalidState(
                    "pre-auth integrity requires an SMB 3.1.1 connection".to_string(),
                ));
            }
            PreauthHashState::Invalid => {
                return Err(Error::InvalidState(
                    "pre-auth integrity chain is invalid; renegotiation required".to_string(),
                ));
            }
            _ => {}
        }

        let state = std::mem::replace(&mut inner.preauth, PreauthHashState::Invalid);
        let next = state.next(data);
        if next == PreauthHashState::Invalid {
            inner.preauth = PreauthHashState::Invalid;
            return Err(Error::InvalidState(
                "pre-auth integrity chain is invalid; renegotiation required".to_string(),
            ));
        }
        inner.preauth = next;
        Ok(())
    }

    /// The current chain value, as a defensive copy.
    pub fn preauth_integrity_hash(&self) -> crate::Result<PreauthHashValue> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.preauth.value().ok_or_else(|| {
            Error::InvalidState("no pre-auth integrity hash on this connection".to_string())
        })
    }

    /// Freezes the chain at session-key derivation and returns its value.
    /// Idempotent: later sessions on the same connection read the same
    /// frozen value.
    pub(crate) fn finish_preauth_hash(&self) -> crate::Result<PreauthHashValue> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.preauth {
            PreauthHashState::InProgress(hash) => {
                inner.preauth = PreauthHashState::Finished(hash);
                Ok(hash)
            }
            PreauthHashState::Finished(hash) => Ok(hash),
            _ => Err(Error::InvalidState(
                "no pre-auth integrity hash on this connection".to_string(),
            )),
        }
    }

    /// Sends one request and receives its response, serialized with all
    /// other I/O on this transport. A wire failure marks the transport
    /// failed; the caller decides whether to retry over a fresh one.
    pub(crate) fn exchange<R, P>(
        &self,
        req: &mut R,
        resp: &mut P,
        fold: PreauthFold,
    ) -> crate::Result<()>
    where
        R: Request + ?Sized,
        P: Response + ?Sized,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if self.state() != TransportState::Connected {
            return Err(Error::Transport(TransportError::NotConnected));
        }

        let sent = req.encode()?;
        let wire = inner
            .wire
            .as_mut()
            .ok_or(Error::Transport(TransportError::NotConnected))?;

        let received = match wire.send(&sent).and_then(|_| wire.receive()) {
            Ok(received) => received,
            Err(source) => {
                log::warn!("Wire failure on transport {}: {source}", self.host);
                self.mark_failed_locked(&mut inner);
                return Err(Error::Transport(source));
            }
        };
        resp.decode(&received)?;

        if fold == PreauthFold::SessionSetup && inner.preauth.is_in_progress() {
            self.update_preauth_locked(&mut inner, &sent)?;
            if resp.status() == Status::MORE_PROCESSING_REQUIRED {
                self.update_preauth_locked(&mut inner, &received)?;
            }
        }

        Ok(())
    }

    /// Returns an authenticated-context handle for the given principal on
    /// this transport, reusing a live matching session when one exists.
    pub(crate) fn session(
        self: &Arc<Self>,
        ctx: &CifsContext,
        target_host: &str,
        target_domain: Option<&str>,
    ) -> Arc<Session> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.retain(|weak| weak.strong_count() > 0);

        for weak in sessions.iter() {
            if let Some(session) = weak.upgrade() {
                if session.in_use() && session.matches(ctx.credentials(), target_host, target_domain)
                {
                    log::trace!("Reusing session for {target_host} on transport {}", self.host);
                    return session.acquire();
                }
            }
        }

        let session = Arc::new(Session::new(ctx, self, target_host, target_domain));
        sessions.push(Arc::downgrade(&session));
        session
    }

    /// Number of live sessions multiplexed on this transport.
    pub fn session_count(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .iter()
            .filter_map(|weak| weak.upgrade())
            .filter(|session| session.in_use())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;

    fn test_transport() -> Arc<Transport> {
        let ctx = CifsContext::new(
            crate::config::ClientConfig::default(),
            Credentials::password("DOM", "user", "pw"),
        );
        let addr: SocketAddr = "127.0.0.1:445".parse().unwrap();
        Arc::new(Transport::new(&ctx, "server", addr, 445, false))
    }

    #[test]
    fn test_initial_state() {
        let transport = test_transport();
        assert_eq!(transport.state(), TransportState::Disconnected);
        assert_eq!(transport.usage_count(), 1);
        assert!(!transport.signing_enforced());
        assert!(transport.negotiate_info().is_err());
    }

    #[test]
    fn test_acquire_release_counting() {
        let transport = test_transport();
        let t2 = transport.acquire();
        assert_eq!(transport.usage_count(), 2);
        t2.release();
        assert_eq!(transport.usage_count(), 1);
        transport.release();
        assert_eq!(transport.usage_count(), 0);
        assert!(!transport.in_use());
    }

    #[test]
    #[should_panic(expected = "dropped below zero")]
    fn test_release_past_zero_panics() {
        let transport = test_transport();
        transport.release();
        transport.release();
    }

    #[test]
    fn test_matches_identity() {
        let transport = test_transport();
        assert!(transport.matches("SERVER", 445, None));
        assert!(!transport.matches("server", 139, None));
        assert!(!transport.matches("other", 445, None));
        let bind: SocketAddr = "10.0.0.1:0".parse().unwrap();
        assert!(!transport.matches("server", 445, Some(bind)));
    }

    #[test]
    fn test_preauth_requires_negotiated_311() {
        let transport = test_transport();
        // No negotiate has happened; there is no chain to update.
        let err = transport.update_preauth_hash(b"bytes").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(transport.preauth_integrity_hash().is_err());
        assert!(transport.finish_preauth_hash().is_err());
    }

    #[test]
    fn test_forced_signing_is_enforced_from_creation() {
        let ctx = CifsContext::new(
            crate::config::ClientConfig::default(),
            Credentials::password("DOM", "user", "pw"),
        );
        let addr: SocketAddr = "127.0.0.1:445".parse().unwrap();
        let transport = Transport::new(&ctx, "server", addr, 445, true);
        assert!(transport.signing_enforced());
        assert!(!transport.signing_required_by_server());
    }
}
