//! Session logic: the authenticated logical context bound to one
//! transport.
//!
//! A session owns a copy-on-write collection of [`Tree`]s and drives the
//! authentication negotiator during setup. Lifetime is governed by
//! explicit usage counting: construction counts as the first use, and the
//! release that brings usage to zero tears the session down under a lock
//! that double-checks for racing acquirers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::auth::{self, Credentials, SecurityContextFactory};
use crate::config::ClientConfig;
use crate::context::CifsContext;
use crate::error::Error;
use crate::msg::{MessageBuilder, Request, Response, Status};
use crate::transport::{PreauthFold, PreauthHashValue, Transport};
use crate::tree::Tree;

/// An authenticated logical context over a [`Transport`].
#[derive(Debug)]
pub struct Session {
    transport: Arc<Transport>,
    /// Whether this session currently counts one usage on its transport.
    transport_acquired: AtomicBool,

    usage: AtomicIsize,
    credentials: Credentials,
    target_host: String,
    target_domain: Option<String>,

    session_id: AtomicU64,
    established: AtomicBool,
    /// Chain snapshot taken at session-key derivation on 3.1.1.
    preauth_hash: Mutex<Option<PreauthHashValue>>,

    /// Copy-on-write tree collection keyed by share name: lookups clone
    /// the map handle under a read lock and never observe a torn insert.
    trees: RwLock<Arc<HashMap<String, Arc<Tree>>>>,

    teardown: Mutex<()>,
    setup_lock: Mutex<()>,

    config: Arc<ClientConfig>,
    builder: Arc<dyn MessageBuilder>,
    security_factory: Arc<dyn SecurityContextFactory>,
}

impl Session {
    /// Creates a session on the given transport, acquiring it and taking a
    /// defensive clone of the context credentials. The new session starts
    /// with a usage count of one, owned by the caller.
    pub(crate) fn new(
        ctx: &CifsContext,
        transport: &Arc<Transport>,
        target_host: &str,
        target_domain: Option<&str>,
    ) -> Session {
        Session {
            transport: transport.acquire(),
            transport_acquired: AtomicBool::new(true),
            usage: AtomicIsize::new(1),
            credentials: ctx.credentials().clone(),
            target_host: target_host.to_string(),
            target_domain: target_domain.map(str::to_string),
            session_id: AtomicU64::new(0),
            established: AtomicBool::new(false),
            preauth_hash: Mutex::new(None),
            trees: RwLock::new(Arc::new(HashMap::new())),
            teardown: Mutex::new(()),
            setup_lock: Mutex::new(()),
            config: ctx.config_arc(),
            builder: ctx.message_builder(),
            security_factory: ctx.security_factory(),
        }
    }

    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    pub fn target_domain(&self) -> Option<&str> {
        self.target_domain.as_deref()
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::SeqCst)
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    pub fn in_use(&self) -> bool {
        self.usage.load(Ordering::SeqCst) > 0
    }

    pub fn usage_count(&self) -> isize {
        self.usage.load(Ordering::SeqCst)
    }

    /// The pre-auth integrity hash captured at session-key derivation.
    pub fn preauth_hash(&self) -> Option<PreauthHashValue> {
        *self.preauth_hash.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn builder(&self) -> &Arc<dyn MessageBuilder> {
        &self.builder
    }

    /// Whether this session serves the given principal and target.
    pub(crate) fn matches(
        &self,
        credentials: &Credentials,
        target_host: &str,
        target_domain: Option<&str>,
    ) -> bool {
        self.credentials == *credentials
            && self.target_host.eq_ignore_ascii_case(target_host)
            && match (self.target_domain.as_deref(), target_domain) {
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                (None, None) => true,
                _ => false,
            }
    }

    /// Takes another usage on this session. Resurrecting from zero
    /// re-acquires the transport.
    pub fn acquire(self: &Arc<Self>) -> Arc<Session> {
        let usage = self.usage.fetch_add(1, Ordering::SeqCst) + 1;
        log::trace!("Acquire session {usage} for {}", self.target_host);

        if usage == 1 {
            let _guard = self.teardown.lock().unwrap_or_else(|e| e.into_inner());
            if self
                .transport_acquired
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                log::debug!("Reacquire transport");
                let _ = self.transport.acquire();
            }
        }

        self.clone()
    }

    /// Releases one usage. Reaching zero tears the session down: the tree
    /// collection is snapshotted and cleared, each tree released, a
    /// best-effort logoff sent, and the transport released — all under the
    /// teardown lock with a double-check of the count, since an acquirer
    /// may race in. Releasing below zero is a double-close and panics.
    pub fn release(&self) {
        let usage = self.usage.fetch_sub(1, Ordering::SeqCst) - 1;
        log::trace!("Release session {usage} for {}", self.target_host);

        if usage < 0 {
            panic!("Session usage count dropped below zero");
        }
        if usage > 0 {
            return;
        }

        let _guard = self.teardown.lock().unwrap_or_else(|e| e.into_inner());
        if self.usage.load(Ordering::SeqCst) != 0 {
            // Another thread acquired the session.
            return;
        }

        log::debug!("Usage dropped to zero, releasing session for {}", self.target_host);

        let snapshot = {
            let mut trees = self.trees.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *trees, Arc::new(HashMap::new()))
        };
        for tree in snapshot.values() {
            tree.release();
        }

        self.logoff();

        if self
            .transport_acquired
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.transport.release();
        }
    }

    /// Get-or-create over the tree collection. The returned tree is
    /// acquired for the caller; the collection keeps its own reference
    /// until session teardown.
    pub fn tree(self: &Arc<Self>, share: &str, service: Option<&str>) -> Arc<Tree> {
        let key = share.to_ascii_lowercase();

        {
            // Fast path: clone the map handle and get out of the lock.
            let map = self
                .trees
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(tree) = map.get(&key) {
                if tree.matches(share, service) {
                    return tree.acquire();
                }
            }
        }

        let mut guard = self.trees.write().unwrap_or_else(|e| e.into_inner());
        if let Some(tree) = guard.get(&key) {
            if tree.matches(share, service) {
                return tree.acquire();
            }
            // Same share reconnected with a different service type: the
            // replaced tree loses its collection reference.
            tree.release();
        }

        let tree = Arc::new(Tree::new(self.clone(), share, service));
        let mut next = (**guard).clone();
        next.insert(key, tree.clone());
        *guard = Arc::new(next);
        tree.acquire()
    }

    /// Performs session setup: mechanism negotiation followed by one or
    /// more token-exchange rounds (NTLM typically two, Kerberos typically
    /// one). On 3.1.1 every setup message is folded into the transport's
    /// pre-auth integrity chain, and the chain value is captured at
    /// success for session-key derivation.
    pub fn setup(&self) -> crate::Result<()> {
        if self.is_established() {
            return Ok(());
        }
        let _guard = self.setup_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_established() {
            return Ok(());
        }

        let info = self.transport.negotiate_info()?;
        let decision = auth::negotiate(
            &self.credentials,
            &self.config.auth,
            self.security_factory.as_ref(),
            &self.target_host,
            &info.mechanisms,
        )?;
        let mechanism = decision.mechanism;
        let mut context = decision.context;

        let fold = if info.dialect.has_preauth_integrity() {
            PreauthFold::SessionSetup
        } else {
            PreauthFold::No
        };

        let mut input = info.security_blob.clone();
        loop {
            let token = context.initialize(&input)?;
            let (mut req, mut resp) = self.builder.session_setup(&token);
            req.set_session_id(self.session_id.load(Ordering::SeqCst));
            self.transport.exchange(req.as_mut(), resp.as_mut(), fold)?;

            // The server assigns the session id on the first answer,
            // including MORE_PROCESSING_REQUIRED ones.
            if self.session_id.load(Ordering::SeqCst) == 0 {
                self.session_id.store(resp.session_id(), Ordering::SeqCst);
            }

            let status = resp.status();
            if status == Status::MORE_PROCESSING_REQUIRED {
                input = resp.security_token().to_vec();
                continue;
            }
            if status == Status::LOGON_FAILURE || status == Status::ACCESS_DENIED {
                return Err(Error::Authentication(format!(
                    "session setup with {} was rejected: status {status}",
                    self.target_host
                )));
            }
            if status.is_error() {
                return Err(Error::ServerError(status));
            }

            // Mutual authentication may carry one final server token.
            let final_token = resp.security_token();
            if !final_token.is_empty() && !context.is_established() {
                context.initialize(final_token)?;
            }

            if fold == PreauthFold::SessionSetup {
                let hash = self.transport.finish_preauth_hash()?;
                *self
                    .preauth_hash
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(hash);
            }

            let _ = context.dispose();
            self.established.store(true, Ordering::SeqCst);
            log::info!(
                "Session setup complete for {} using {mechanism:?}",
                self.target_host
            );
            return Ok(());
        }
    }

    /// Stamps the session id and exchanges one request over the transport.
    pub(crate) fn send<R, P>(&self, req: &mut R, resp: &mut P) -> crate::Result<()>
    where
        R: Request + ?Sized,
        P: Response + ?Sized,
    {
        req.set_session_id(self.session_id.load(Ordering::SeqCst));
        self.transport.exchange(req, resp, PreauthFold::No)
    }

    /// Best-effort logoff; errors are logged, not surfaced, since the
    /// session is going away either way.
    fn logoff(&self) {
        if !self.established.swap(false, Ordering::SeqCst) {
            return;
        }
        log::debug!("Logging off session {}", self.session_id());

        let (mut req, mut resp) = self.builder.logoff();
        req.set_session_id(self.session_id.load(Ordering::SeqCst));
        match self
            .transport
            .exchange(req.as_mut(), resp.as_mut(), PreauthFold::No)
        {
            Ok(()) if resp.status().is_success() => log::info!("Session logged off"),
            Ok(()) => log::debug!("Logoff returned status {}", resp.status()),
            Err(e) => log::debug!("Logoff failed: {e}"),
        }
        self.session_id.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use std::net::SocketAddr;

    fn test_context() -> Arc<CifsContext> {
        Arc::new(CifsContext::new(
            ClientConfig::default(),
            Credentials::password("DOM", "user", "pw"),
        ))
    }

    fn test_transport(ctx: &CifsContext) -> Arc<Transport> {
        let addr: SocketAddr = "127.0.0.1:445".parse().unwrap();
        Arc::new(Transport::new(ctx, "server", addr, 445, false))
    }

    #[test]
    fn test_construction_acquires_transport() {
        let ctx = test_context();
        let transport = test_transport(&ctx);
        assert_eq!(transport.usage_count(), 1);

        let session = Arc::new(Session::new(&ctx, &transport, "server", None));
        assert_eq!(transport.usage_count(), 2);
        assert_eq!(session.usage_count(), 1);

        session.release();
        assert_eq!(transport.usage_count(), 1);
        assert!(!session.in_use());
    }

    #[test]
    fn test_acquire_release_balance() {
        let ctx = test_context();
        let transport = test_transport(&ctx);
        let session = Arc::new(Session::new(&ctx, &transport, "server", None));

        let s2 = session.acquire();
        let s3 = session.acquire();
        assert_eq!(session.usage_count(), 3);

        s2.release();
        s3.release();
        assert!(session.in_use());
        session.release();
        assert!(!session.in_use());
        assert_eq!(transport.usage_count(), 1);
    }

    #[test]
    #[should_panic(expected = "dropped below zero")]
    fn test_release_past_zero_panics() {
        let ctx = test_context();
        let transport = test_transport(&ctx);
        let session = Arc::new(Session::new(&ctx, &transport, "server", None));
        session.release();
        session.release();
    }

    #[test]
    fn test_resurrection_reacquires_transport() {
        let ctx = test_context();
        let transport = test_transport(&ctx);
        let session = Arc::new(Session::new(&ctx, &transport, "server", None));

        session.release();
        assert_eq!(transport.usage_count(), 1);

        let resurrected = session.acquire();
        assert_eq!(transport.usage_count(), 2);
        resurrected.release();
        assert_eq!(transport.usage_count(), 1);
    }

    #[test]
    fn test_tree_get_or_create_identity() {
        let ctx = test_context();
        let transport = test_transport(&ctx);
        let session = Arc::new(Session::new(&ctx, &transport, "server", None));

        let a = session.tree("Data", None);
        let b = session.tree("data", None);
        assert!(Arc::ptr_eq(&a, &b));

        let c = session.tree("other", None);
        assert!(!Arc::ptr_eq(&a, &c));

        a.release();
        b.release();
        c.release();
        session.release();
    }

    #[test]
    fn test_teardown_releases_trees() {
        let ctx = test_context();
        let transport = test_transport(&ctx);
        let session = Arc::new(Session::new(&ctx, &transport, "server", None));

        let tree = session.tree("data", None);
        // One usage for the collection, one for us.
        assert_eq!(tree.usage_count(), 2);

        tree.release();
        assert_eq!(tree.usage_count(), 1);

        // Session teardown drops the collection reference too.
        session.release();
        assert_eq!(tree.usage_count(), 0);
        assert!(!tree.is_connected());
    }

    #[test]
    fn test_matches_credentials_and_target() {
        let ctx = test_context();
        let transport = test_transport(&ctx);
        let session = Arc::new(Session::new(&ctx, &transport, "server", Some("dom")));

        assert!(session.matches(ctx.credentials(), "SERVER", Some("DOM")));
        assert!(!session.matches(ctx.credentials(), "other", Some("dom")));
        assert!(!session.matches(ctx.credentials(), "server", None));

        let other = Credentials::password("DOM", "someone-else", "pw");
        assert!(!session.matches(&other, "server", Some("dom")));
        session.release();
    }
}
