//! The tree-connection handle held by the filesystem layer.
//!
//! Wraps a bound [`Tree`] with the pieces the share-level API needs:
//! DFS resolution on connect, automatic reconnect, and replay of requests
//! after transport-level failures within a configured retry budget.
//! Protocol errors from the server are final and never replayed.

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::CifsContext;
use crate::dfs::DfsReferral;
use crate::error::Error;
use crate::msg::{Request, Response, ShareType};
use crate::session::Session;
use crate::transport::Transport;
use crate::tree::Tree;
use crate::unc::UncPath;

/// Per-send options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Attempt the send exactly once, surfacing any transport failure
    /// without reconnecting.
    pub no_retry: bool,
}

impl SendOptions {
    pub const NO_RETRY: SendOptions = SendOptions { no_retry: true };

    pub fn new() -> SendOptions {
        SendOptions::default()
    }
}

#[derive(Debug)]
struct Binding {
    session: Arc<Session>,
    tree: Arc<Tree>,
    /// The referral that rewrote the locator, kept for reconstructing
    /// share-relative paths from `path_consumed`.
    referral: Option<DfsReferral>,
    target: UncPath,
}

/// A reference-counted handle on one share, resilient to transport
/// failures.
#[derive(Debug)]
pub struct TreeConnection {
    ctx: Arc<CifsContext>,
    binding: Mutex<Option<Binding>>,
    usage: AtomicIsize,
}

impl TreeConnection {
    /// Creates an unbound handle, counted as one use owned by the caller.
    pub fn new(ctx: Arc<CifsContext>) -> Arc<TreeConnection> {
        Arc::new(TreeConnection {
            ctx,
            binding: Mutex::new(None),
            usage: AtomicIsize::new(1),
        })
    }

    pub fn usage_count(&self) -> isize {
        self.usage.load(Ordering::SeqCst)
    }

    pub fn acquire(self: &Arc<Self>) -> Arc<TreeConnection> {
        let usage = self.usage.fetch_add(1, Ordering::SeqCst) + 1;
        log::trace!("Acquire tree connection ({usage})");
        self.clone()
    }

    /// Releases one use; the last release unbinds the tree and session.
    /// Releasing past zero panics.
    pub fn release(&self) {
        let usage = self.usage.fetch_sub(1, Ordering::SeqCst) - 1;
        log::trace!("Release tree connection ({usage})");

        if usage < 0 {
            panic!("TreeConnection usage count dropped below zero");
        }
        if usage > 0 {
            return;
        }

        let mut binding = self.binding.lock().unwrap_or_else(|e| e.into_inner());
        if self.usage.load(Ordering::SeqCst) != 0 {
            return;
        }
        if let Some(binding) = binding.take() {
            binding.tree.release();
            binding.session.release();
        }
    }

    pub fn is_connected(&self) -> bool {
        let binding = self.binding.lock().unwrap_or_else(|e| e.into_inner());
        binding.as_ref().is_some_and(|b| b.tree.is_connected())
    }

    /// The type of the connected share.
    pub fn tree_type(&self) -> Option<ShareType> {
        let binding = self.binding.lock().unwrap_or_else(|e| e.into_inner());
        binding.as_ref().and_then(|b| b.tree.share_type())
    }

    /// The share currently connected to, after any DFS rewrite.
    pub fn connected_share(&self) -> Option<String> {
        let binding = self.binding.lock().unwrap_or_else(|e| e.into_inner());
        binding.as_ref().map(|b| b.target.share().to_string())
    }

    /// The referral applied at connect time, if the locator was rewritten.
    pub fn applied_referral(&self) -> Option<DfsReferral> {
        let binding = self.binding.lock().unwrap_or_else(|e| e.into_inner());
        binding.as_ref().and_then(|b| b.referral.clone())
    }

    /// Whether both handles are bound to the same underlying tree object.
    /// Identity, not structural equality: used for same-tree fast paths
    /// such as server-side copy.
    pub fn is_same(&self, other: &TreeConnection) -> bool {
        let mine = {
            let binding = self.binding.lock().unwrap_or_else(|e| e.into_inner());
            binding.as_ref().map(|b| b.tree.clone())
        };
        let theirs = {
            let binding = other.binding.lock().unwrap_or_else(|e| e.into_inner());
            binding.as_ref().map(|b| b.tree.clone())
        };
        match (mine, theirs) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a, &b),
            _ => false,
        }
    }

    /// Connects to the share the locator names: resolves DFS (possibly
    /// rewriting the target), obtains a pooled transport and a session on
    /// it, authenticates, and sends the tree connect.
    pub fn connect(&self, locator: &UncPath) -> crate::Result<()> {
        let mut binding = self.binding.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(b) = binding.as_ref() {
            if b.tree.is_connected() {
                return Ok(());
            }
        }
        self.connect_locked(&mut binding, locator)
    }

    fn connect_locked(
        &self,
        binding: &mut Option<Binding>,
        locator: &UncPath,
    ) -> crate::Result<()> {
        if let Some(stale) = binding.take() {
            stale.tree.release();
            stale.session.release();
        }

        let mut target = locator.clone();
        let mut referral = None;
        if self.ctx.config().dfs.enabled {
            if let Some(r) = self.ctx.dfs().resolve(
                &self.ctx,
                Some(locator.server()),
                Some(locator.share()),
                locator.path(),
            )? {
                target = apply_referral(locator, &r);
                log::debug!("DFS referral rewrites {locator} to {target}");
                referral = Some(r);
            }
        }

        let transport = self.ctx.pool().get_transport(
            &self.ctx,
            target.server(),
            self.ctx.config().port,
            false,
            self.ctx.config().signing_enforced,
        )?;
        if let Err(e) = transport.ensure_connected() {
            self.drop_failed_transport(&transport, &e);
            return Err(e);
        }

        let domain = self.ctx.credentials().domain().map(str::to_string);
        let session = transport.session(&self.ctx, target.server(), domain.as_deref());

        if let Err(e) = session.setup() {
            session.release();
            self.drop_failed_transport(&transport, &e);
            return Err(e);
        }

        let tree = session.tree(target.share(), None);
        if let Err(e) = tree.connect() {
            tree.release();
            session.release();
            self.drop_failed_transport(&transport, &e);
            return Err(e);
        }

        // The session holds its own transport usage from here on.
        transport.release();

        log::debug!("Connected to {target}");
        *binding = Some(Binding {
            session,
            tree,
            referral,
            target,
        });
        Ok(())
    }

    fn drop_failed_transport(&self, transport: &Arc<Transport>, error: &Error) {
        if error.is_retryable() {
            self.ctx.pool().remove_transport(transport);
        }
        transport.release();
    }

    /// Sends one request, reconnecting first if the binding is stale.
    ///
    /// A transport-level failure resets the request and response to their
    /// pre-send state, force-disconnects tree, session and transport, and
    /// replays over a fresh connection — up to the configured budget, for
    /// `max_request_retries + 1` attempts in total. Exhausting the budget
    /// surfaces the last transport error unchanged. Server error statuses
    /// are never retried.
    ///
    /// Handle-release requests bypass reconnection and DFS entirely: a
    /// close must reach whatever tree currently holds the handle, or the
    /// server-side handle leaks.
    pub fn send<R, P>(
        &self,
        locator: &UncPath,
        request: &mut R,
        response: &mut P,
        options: SendOptions,
    ) -> crate::Result<()>
    where
        R: Request + ?Sized,
        P: Response + ?Sized,
    {
        if request.is_handle_release() {
            let tree = {
                let binding = self.binding.lock().unwrap_or_else(|e| e.into_inner());
                binding
                    .as_ref()
                    .map(|b| b.tree.clone())
                    .ok_or_else(|| Error::InvalidState("no tree is connected".to_string()))?
            };
            return tree.send(request, response);
        }

        let budget = if options.no_retry {
            0
        } else {
            self.ctx.config().max_request_retries
        };

        let mut attempt = 0u32;
        loop {
            match self.try_send(locator, request, response) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < budget => {
                    attempt += 1;
                    log::warn!(
                        "Transport failure, retrying ({attempt}/{budget}): {e}"
                    );
                    request.reset();
                    response.reset();
                    self.force_disconnect();
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_send<R, P>(
        &self,
        locator: &UncPath,
        request: &mut R,
        response: &mut P,
    ) -> crate::Result<()>
    where
        R: Request + ?Sized,
        P: Response + ?Sized,
    {
        let tree = {
            let mut binding = self.binding.lock().unwrap_or_else(|e| e.into_inner());
            let connected = binding.as_ref().is_some_and(|b| b.tree.is_connected());
            if !connected {
                self.connect_locked(&mut binding, locator)?;
            }
            match binding.as_ref() {
                Some(b) => b.tree.clone(),
                None => return Err(Error::InvalidState("no tree is connected".to_string())),
            }
        };
        tree.send(request, response)
    }

    /// Unbinds and evicts the underlying transport; the next attempt
    /// builds the whole chain afresh.
    fn force_disconnect(&self) {
        let mut binding = self.binding.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(binding) = binding.take() {
            log::debug!("Force-disconnecting {} for reconnect", binding.target);
            let transport = binding.session.transport().clone();
            self.ctx.pool().remove_transport(&transport);
            binding.tree.release();
            binding.session.release();
            transport.disconnect();
        }
    }
}

/// Rewrites a locator per a DFS referral, reconstructing the remaining
/// share-relative path from `path_consumed`.
fn apply_referral(locator: &UncPath, referral: &DfsReferral) -> UncPath {
    let relative = match locator.path() {
        Some(path) => format!(r"\{path}"),
        None => String::new(),
    };
    let remaining = relative.get(referral.path_consumed..).unwrap_or("");
    UncPath::new(&referral.server, &referral.share).with_path(remaining)
}
