//! The bound tree: one connected share under a session.

use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::msg::{Request, Response, ShareType};
use crate::session::Session;

/// Connection state of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TreeState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl TreeState {
    fn from_u8(value: u8) -> TreeState {
        match value {
            1 => TreeState::Connecting,
            2 => TreeState::Connected,
            _ => TreeState::Disconnected,
        }
    }
}

/// A share bound under a [`Session`].
///
/// Lives in the session's tree collection, which owns the construction
/// usage; external holders stack their own acquisitions on top. The
/// session's teardown releases the collection reference, so a tree never
/// outlives its session's protocol lifetime.
#[derive(Debug)]
pub struct Tree {
    share: String,
    service: Option<String>,
    session: Arc<Session>,

    tree_id: AtomicU32,
    share_type: Mutex<Option<ShareType>>,
    in_dfs: AtomicBool,
    state: AtomicU8,
    usage: AtomicIsize,
    connect_lock: Mutex<()>,
}

impl Tree {
    pub(crate) fn new(session: Arc<Session>, share: &str, service: Option<&str>) -> Tree {
        Tree {
            share: share.to_string(),
            service: service.map(str::to_string),
            session,
            tree_id: AtomicU32::new(0),
            share_type: Mutex::new(None),
            in_dfs: AtomicBool::new(false),
            state: AtomicU8::new(TreeState::Disconnected as u8),
            usage: AtomicIsize::new(1),
            connect_lock: Mutex::new(()),
        }
    }

    pub fn share(&self) -> &str {
        &self.share
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn state(&self) -> TreeState {
        TreeState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TreeState::Connected
    }

    pub fn tree_id(&self) -> u32 {
        self.tree_id.load(Ordering::SeqCst)
    }

    pub fn share_type(&self) -> Option<ShareType> {
        *self.share_type.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the server flagged this share as part of a DFS namespace.
    pub fn is_dfs_share(&self) -> bool {
        self.in_dfs.load(Ordering::SeqCst)
    }

    pub fn usage_count(&self) -> isize {
        self.usage.load(Ordering::SeqCst)
    }

    /// Whether this tree serves the given share/service pair. A `None`
    /// service request matches any service.
    pub fn matches(&self, share: &str, service: Option<&str>) -> bool {
        self.share.eq_ignore_ascii_case(share)
            && match service {
                None => true,
                Some(service) => self.service.as_deref() == Some(service),
            }
    }

    pub fn acquire(self: &Arc<Self>) -> Arc<Tree> {
        let usage = self.usage.fetch_add(1, Ordering::SeqCst) + 1;
        log::trace!("Acquire tree {} ({usage})", self.share);
        self.clone()
    }

    /// Releases one usage. The release that reaches zero sends a
    /// best-effort tree disconnect; going below zero panics.
    pub fn release(&self) {
        let usage = self.usage.fetch_sub(1, Ordering::SeqCst) - 1;
        log::trace!("Release tree {} ({usage})", self.share);

        if usage < 0 {
            panic!("Tree usage count dropped below zero");
        }
        if usage == 0 {
            self.disconnect();
        }
    }

    /// Sends the tree connect for this share, establishing the tree id.
    /// Runs session setup first if the session is not yet authenticated.
    pub fn connect(&self) -> crate::Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let _guard = self.connect_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_connected() {
            return Ok(());
        }

        self.session.setup()?;

        self.state
            .store(TreeState::Connecting as u8, Ordering::SeqCst);

        let unc = format!(r"\\{}\{}", self.session.target_host(), self.share);
        log::debug!("Tree connect to {unc}");

        let (mut req, mut resp) = self.session.builder().tree_connect(&unc);
        if let Err(e) = self.session.send(req.as_mut(), resp.as_mut()) {
            self.state
                .store(TreeState::Disconnected as u8, Ordering::SeqCst);
            return Err(e);
        }

        let status = resp.status();
        if status.is_error() {
            self.state
                .store(TreeState::Disconnected as u8, Ordering::SeqCst);
            return Err(Error::ServerError(status));
        }

        self.tree_id.store(resp.tree_id(), Ordering::SeqCst);
        *self.share_type.lock().unwrap_or_else(|e| e.into_inner()) = Some(resp.share_type());
        self.in_dfs.store(resp.is_dfs(), Ordering::SeqCst);
        self.state
            .store(TreeState::Connected as u8, Ordering::SeqCst);

        log::info!("Connected tree {unc} (tree id {})", self.tree_id());
        Ok(())
    }

    /// Stamps the tree id and exchanges one request. A server error status
    /// is surfaced as [`Error::ServerError`] and is final: protocol errors
    /// are answers, not failures to talk.
    pub fn send<R, P>(&self, request: &mut R, response: &mut P) -> crate::Result<()>
    where
        R: Request + ?Sized,
        P: Response + ?Sized,
    {
        if !self.is_connected() {
            return Err(Error::InvalidState(format!(
                "tree {} is not connected",
                self.share
            )));
        }

        request.set_tree_id(self.tree_id());
        self.session.send(request, response)?;

        let status = response.status();
        if status.is_error() {
            return Err(Error::ServerError(status));
        }
        Ok(())
    }

    /// Best-effort tree disconnect; errors are logged only.
    fn disconnect(&self) {
        let previous = self.state.swap(TreeState::Disconnected as u8, Ordering::SeqCst);
        if TreeState::from_u8(previous) != TreeState::Connected {
            return;
        }

        log::debug!("Disconnecting tree {}", self.share);
        let (mut req, mut resp) = self.session.builder().tree_disconnect();
        req.set_tree_id(self.tree_id());
        if let Err(e) = self.session.send(req.as_mut(), resp.as_mut()) {
            log::debug!("Tree disconnect failed: {e}");
        }
        self.tree_id.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::config::ClientConfig;
    use crate::context::CifsContext;
    use crate::transport::Transport;
    use std::net::SocketAddr;

    fn test_session() -> Arc<Session> {
        let ctx = Arc::new(CifsContext::new(
            ClientConfig::default(),
            Credentials::password("DOM", "user", "pw"),
        ));
        let addr: SocketAddr = "127.0.0.1:445".parse().unwrap();
        let transport = Arc::new(Transport::new(&ctx, "server", addr, 445, false));
        Arc::new(Session::new(&ctx, &transport, "server", None))
    }

    #[test]
    fn test_matches_share_and_service() {
        let session = test_session();
        let tree = Arc::new(Tree::new(session.clone(), "Data", Some("A:")));

        assert!(tree.matches("data", None));
        assert!(tree.matches("DATA", Some("A:")));
        assert!(!tree.matches("data", Some("IPC")));
        assert!(!tree.matches("other", None));

        tree.release();
        session.release();
    }

    #[test]
    fn test_initial_state() {
        let session = test_session();
        let tree = Arc::new(Tree::new(session.clone(), "data", None));

        assert_eq!(tree.state(), TreeState::Disconnected);
        assert!(!tree.is_connected());
        assert_eq!(tree.tree_id(), 0);
        assert_eq!(tree.share_type(), None);
        assert!(!tree.is_dfs_share());

        tree.release();
        session.release();
    }

    #[test]
    #[should_panic(expected = "dropped below zero")]
    fn test_release_past_zero_panics() {
        let session = test_session();
        let tree = Arc::new(Tree::new(session.clone(), "data", None));
        tree.release();
        tree.release();
    }

    #[test]
    fn test_send_requires_connection() {
        let session = test_session();
        let tree = Arc::new(Tree::new(session.clone(), "data", None));

        #[derive(Debug)]
        struct NoopRequest;
        impl Request for NoopRequest {
            fn encode(&self) -> crate::Result<Vec<u8>> {
                Ok(Vec::new())
            }
            fn reset(&mut self) {}
            fn set_session_id(&mut self, _: u64) {}
            fn set_tree_id(&mut self, _: u32) {}
        }
        #[derive(Debug)]
        struct NoopResponse;
        impl Response for NoopResponse {
            fn decode(&mut self, _: &[u8]) -> crate::Result<()> {
                Ok(())
            }
            fn reset(&mut self) {}
            fn status(&self) -> crate::msg::Status {
                crate::msg::Status::SUCCESS
            }
            fn is_received(&self) -> bool {
                false
            }
        }

        let mut req = NoopRequest;
        let mut resp = NoopResponse;
        assert!(matches!(
            tree.send(&mut req, &mut resp),
            Err(Error::InvalidState(_))
        ));

        tree.release();
        session.release();
    }
}
