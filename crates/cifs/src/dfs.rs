//! DFS referral resolution and caching.
//!
//! Referrals redirect a logical UNC path to a concrete target
//! server/share. The resolver keeps a process-wide cache keyed by the
//! consumed path prefix, with each entry holding a bounded ring of sibling
//! targets rotated round-robin. The actual referral queries travel over a
//! [`ReferralSource`] supplied by the RPC layer.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::context::CifsContext;
use crate::error::Error;
use crate::unc::UncPath;

/// Issues DFS referral queries to the remote DFS service.
///
/// The path grammar follows MS-DFSC: `""` enumerates trusted domains,
/// `\domain` locates domain controllers, `\server\share[\path]` asks for
/// link referrals.
pub trait ReferralSource: Send + Sync + fmt::Debug {
    fn get_referrals(&self, path: &str) -> crate::Result<Vec<DfsReferral>>;
}

/// A [`ReferralSource`] that answers every query with "no referrals".
/// The default until an RPC client is installed.
#[derive(Debug, Default)]
pub struct NullReferralSource;

impl ReferralSource for NullReferralSource {
    fn get_referrals(&self, _path: &str) -> crate::Result<Vec<DfsReferral>> {
        Ok(Vec::new())
    }
}

/// One DFS referral target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfsReferral {
    pub server: String,
    pub share: String,
    /// Characters of the request path this referral covers. As delivered
    /// by the server this counts the full `\server\share\path` form; once
    /// cached it is rebased to the share-relative part.
    pub path_consumed: usize,
    /// Server-specified lifetime; `None` falls back to the configured TTL.
    pub ttl: Option<Duration>,
}

impl DfsReferral {
    pub fn new(server: &str, share: &str, path_consumed: usize) -> Self {
        Self {
            server: server.to_string(),
            share: share.to_string(),
            path_consumed,
            ttl: None,
        }
    }
}

/// A bounded ring of sibling referrals with an explicit round-robin
/// cursor.
#[derive(Debug)]
struct ReferralRing {
    targets: Vec<DfsReferral>,
    cursor: AtomicUsize,
}

impl ReferralRing {
    fn new(targets: Vec<DfsReferral>) -> Self {
        debug_assert!(!targets.is_empty());
        Self {
            targets,
            cursor: AtomicUsize::new(0),
        }
    }

    /// The next target in rotation.
    fn next(&self) -> DfsReferral {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.targets.len();
        self.targets[index].clone()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    ring: Arc<ReferralRing>,
    expires_at: Instant,
}

#[derive(Debug)]
struct DomainCache {
    domains: HashSet<String>,
    expires_at: Instant,
}

/// Resolves and caches DFS referrals, and answers trusted-domain queries.
///
/// The cache is copy-on-write: readers clone the map handle under a read
/// lock and scan outside it, so inserting one prefix never blocks lookups
/// of unrelated prefixes.
#[derive(Debug, Default)]
pub struct DfsResolver {
    referrals: RwLock<Arc<HashMap<String, CacheEntry>>>,
    domains: Mutex<Option<DomainCache>>,
}

impl DfsResolver {
    pub fn new() -> DfsResolver {
        DfsResolver::default()
    }

    /// Resolves a referral for `\domain\root\path`.
    ///
    /// Short-circuits to `None` — without any network traffic — when DFS
    /// is disabled, when domain or root is absent, or for the IPC$ share.
    /// Otherwise answers from the unexpired cache or queries the referral
    /// source and caches the result.
    pub fn resolve(
        &self,
        ctx: &CifsContext,
        domain: Option<&str>,
        root: Option<&str>,
        path: Option<&str>,
    ) -> crate::Result<Option<DfsReferral>> {
        if !ctx.config().dfs.enabled {
            return Ok(None);
        }
        let (Some(domain), Some(root)) = (domain, root) else {
            return Ok(None);
        };
        if root.eq_ignore_ascii_case("IPC$") {
            return Ok(None);
        }

        let full = match path {
            Some(p) if !p.is_empty() => format!(r"\{domain}\{root}\{p}"),
            _ => format!(r"\{domain}\{root}"),
        };
        let key = full.to_lowercase();

        if let Some(referral) = self.lookup(&key) {
            log::trace!("DFS cache hit for {full}");
            return Ok(Some(referral));
        }

        let referrals = match ctx.referral_source().get_referrals(&full) {
            Ok(referrals) => referrals,
            Err(e) => {
                // Referral queries are advisory; an unreachable DFS
                // service means "no referral", not a failed operation.
                log::debug!("DFS referral query for {full} failed: {e}");
                return Ok(None);
            }
        };
        if referrals.is_empty() {
            return Ok(None);
        }

        let prefix_len = 1 + domain.len() + 1 + root.len();
        let consumed = referrals[0].path_consumed.clamp(prefix_len, full.len());
        let ttl = referrals[0].ttl.unwrap_or(ctx.config().dfs.ttl);

        let rebased: Vec<DfsReferral> = referrals
            .into_iter()
            .map(|mut r| {
                r.path_consumed = consumed - prefix_len;
                r
            })
            .collect();

        let prefix = full.get(..consumed).unwrap_or(full.as_str());
        let cache_key = trim_trailing_separators(prefix).to_lowercase();
        let ring = Arc::new(ReferralRing::new(rebased));
        let first = ring.next();
        self.insert(cache_key, ring, ttl);

        Ok(Some(first))
    }

    /// Stores a referral learned out-of-band (e.g. from a
    /// PATH_NOT_COVERED status on an ordinary request).
    ///
    /// Disabled DFS makes this a no-op. An unparseable UNC path is also a
    /// no-op — the cache is advisory and never fails the caller.
    pub fn cache(&self, ctx: &CifsContext, unc_path: &str, referral: &DfsReferral) {
        if !ctx.config().dfs.enabled {
            return;
        }

        let parsed: UncPath = match unc_path.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                log::debug!("Ignoring unparseable UNC path for DFS cache: {unc_path}");
                return;
            }
        };

        let full = match parsed.path() {
            Some(p) => format!(r"\{}\{}\{}", parsed.server(), parsed.share(), p),
            None => format!(r"\{}\{}", parsed.server(), parsed.share()),
        }
        .to_lowercase();

        // The key is the consumed prefix; pathConsumed is then rebased to
        // the share-relative part. Samba tends to report values that leave
        // a trailing separator on the prefix, so strip it from the key.
        let prefix_len = parsed.dfs_prefix_len();
        let consumed = if referral.path_consumed == 0 {
            prefix_len
        } else {
            referral.path_consumed.clamp(prefix_len, full.len())
        };
        let prefix = full.get(..consumed).unwrap_or(full.as_str());
        let key = trim_trailing_separators(prefix).to_string();

        let mut rebased = referral.clone();
        rebased.path_consumed = consumed - prefix_len;
        let ttl = referral.ttl.unwrap_or(ctx.config().dfs.ttl);

        log::debug!(
            "Caching DFS referral for {key} -> \\\\{}\\{}",
            rebased.server,
            rebased.share
        );
        self.insert(key, Arc::new(ReferralRing::new(vec![rebased])), ttl);
    }

    /// Whether `domain` is one of the trusted domains reported by the
    /// domain controller. Never errors on connectivity problems: DFS
    /// disabled, domainless credentials, and an unreachable DC all answer
    /// `false`. An empty domain name is caller misuse and does error.
    pub fn is_trusted_domain(&self, ctx: &CifsContext, domain: &str) -> crate::Result<bool> {
        if domain.is_empty() {
            return Err(Error::InvalidArgument(
                "domain name must not be empty".to_string(),
            ));
        }
        if !ctx.config().dfs.enabled {
            return Ok(false);
        }
        if ctx.credentials().domain().is_none() {
            return Ok(false);
        }

        let Some(domains) = self.trusted_domains(ctx) else {
            return Ok(false);
        };
        Ok(domains.contains(&domain.to_lowercase()))
    }

    /// The domain controller responsible for `domain`, or `None` when DFS
    /// is disabled or the DC cannot be reached.
    pub fn get_dc(&self, ctx: &CifsContext, domain: &str) -> crate::Result<Option<String>> {
        if domain.is_empty() {
            return Err(Error::InvalidArgument(
                "domain name must not be empty".to_string(),
            ));
        }
        if !ctx.config().dfs.enabled {
            return Ok(None);
        }

        match ctx.referral_source().get_referrals(&format!(r"\{domain}")) {
            Ok(referrals) => Ok(referrals.into_iter().next().map(|r| r.server)),
            Err(e) => {
                log::debug!("DC referral query for {domain} failed: {e}");
                Ok(None)
            }
        }
    }

    fn trusted_domains(&self, ctx: &CifsContext) -> Option<HashSet<String>> {
        {
            let cached = self.domains.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cache) = cached.as_ref() {
                if cache.expires_at > Instant::now() {
                    return Some(cache.domains.clone());
                }
            }
        }

        let referrals = match ctx.referral_source().get_referrals("") {
            Ok(referrals) => referrals,
            Err(e) => {
                log::debug!("Trusted domain enumeration failed: {e}");
                return None;
            }
        };

        let domains: HashSet<String> = referrals
            .into_iter()
            .map(|r| r.server.to_lowercase())
            .collect();

        // Domain topology changes rarely; cache it well beyond referrals.
        let ttl = ctx.config().dfs.ttl * 10;
        let mut cached = self.domains.lock().unwrap_or_else(|e| e.into_inner());
        *cached = Some(DomainCache {
            domains: domains.clone(),
            expires_at: Instant::now() + ttl,
        });
        Some(domains)
    }

    fn lookup(&self, key: &str) -> Option<DfsReferral> {
        let now = Instant::now();
        let cache = self
            .referrals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut best: Option<(&String, &CacheEntry)> = None;
        for (entry_key, entry) in cache.iter() {
            if entry.expires_at <= now {
                continue;
            }
            let matches = key == entry_key
                || (key.len() > entry_key.len()
                    && key.starts_with(entry_key.as_str())
                    && key.as_bytes()[entry_key.len()] == b'\\');
            if matches && best.is_none_or(|(k, _)| entry_key.len() > k.len()) {
                best = Some((entry_key, entry));
            }
        }
        best.map(|(_, entry)| entry.ring.next())
    }

    fn insert(&self, key: String, ring: Arc<ReferralRing>, ttl: Duration) {
        let mut guard = self.referrals.write().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut next = (**guard).clone();
        next.retain(|_, entry| entry.expires_at > now);
        next.insert(
            key,
            CacheEntry {
                ring,
                expires_at: now + ttl,
            },
        );
        *guard = Arc::new(next);
    }
}

fn trim_trailing_separators(key: &str) -> &str {
    key.trim_end_matches('\\')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::context::CifsContext;
    use crate::auth::Credentials;

    /// A scripted referral source recording every query it receives.
    #[derive(Debug, Default)]
    struct FakeReferralSource {
        answers: Mutex<HashMap<String, Vec<DfsReferral>>>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeReferralSource {
        fn with(path: &str, referrals: Vec<DfsReferral>) -> Self {
            let source = Self::default();
            source
                .answers
                .lock()
                .unwrap()
                .insert(path.to_string(), referrals);
            source
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }
    }

    impl ReferralSource for FakeReferralSource {
        fn get_referrals(&self, path: &str) -> crate::Result<Vec<DfsReferral>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Transport(
                    cifs_transport::TransportError::NotConnected,
                ));
            }
            Ok(self
                .answers
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .unwrap_or_default())
        }
    }

    /// A referral source that must never be consulted.
    #[derive(Debug, Default)]
    struct PanickingReferralSource;

    impl ReferralSource for PanickingReferralSource {
        fn get_referrals(&self, path: &str) -> crate::Result<Vec<DfsReferral>> {
            panic!("unexpected DFS query for {path}");
        }
    }

    fn context_with(
        source: Arc<dyn ReferralSource>,
        credentials: Credentials,
        dfs_enabled: bool,
    ) -> Arc<CifsContext> {
        let mut config = ClientConfig::default();
        config.dfs.enabled = dfs_enabled;
        Arc::new(CifsContext::new(config, credentials).with_referral_source(source))
    }

    fn user_creds() -> Credentials {
        Credentials::password("CORP", "user", "pw")
    }

    #[test]
    fn test_disabled_never_queries() {
        let ctx = context_with(Arc::new(PanickingReferralSource), user_creds(), false);
        let result = ctx.dfs().resolve(&ctx, Some("corp"), Some("dfsroot"), Some("docs"));
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn test_missing_domain_or_root_short_circuits() {
        let ctx = context_with(Arc::new(PanickingReferralSource), user_creds(), true);
        assert!(matches!(
            ctx.dfs().resolve(&ctx, None, Some("root"), None),
            Ok(None)
        ));
        assert!(matches!(
            ctx.dfs().resolve(&ctx, Some("corp"), None, None),
            Ok(None)
        ));
        assert!(matches!(
            ctx.dfs().resolve(&ctx, Some("corp"), Some("IPC$"), None),
            Ok(None)
        ));
    }

    #[test_log::test]
    fn test_resolve_queries_and_caches() {
        let referral = DfsReferral {
            server: "fs1".into(),
            share: "docs".into(),
            // consumes "\corp\dfsroot" of the request
            path_consumed: 13,
            ttl: None,
        };
        let source = Arc::new(FakeReferralSource::with(
            r"\corp\dfsroot\docs",
            vec![referral],
        ));
        let ctx = context_with(source.clone(), user_creds(), true);

        let first = ctx
            .dfs()
            .resolve(&ctx, Some("corp"), Some("dfsroot"), Some("docs"))
            .unwrap()
            .unwrap();
        assert_eq!(first.server, "fs1");
        // Rebased to the share-relative part: nothing beyond the root.
        assert_eq!(first.path_consumed, 0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // Anything under the consumed prefix is now served from cache.
        let second = ctx
            .dfs()
            .resolve(&ctx, Some("corp"), Some("dfsroot"), Some(r"other\file"))
            .unwrap()
            .unwrap();
        assert_eq!(second.server, "fs1");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ring_round_robin() {
        let targets = vec![
            DfsReferral::new("fs1", "share", 13),
            DfsReferral::new("fs2", "share", 13),
        ];
        let source = Arc::new(FakeReferralSource::with(r"\corp\dfsroot", targets));
        let ctx = context_with(source, user_creds(), true);

        let a = ctx
            .dfs()
            .resolve(&ctx, Some("corp"), Some("dfsroot"), None)
            .unwrap()
            .unwrap();
        let b = ctx
            .dfs()
            .resolve(&ctx, Some("corp"), Some("dfsroot"), None)
            .unwrap()
            .unwrap();
        let c = ctx
            .dfs()
            .resolve(&ctx, Some("corp"), Some("dfsroot"), None)
            .unwrap()
            .unwrap();
        assert_eq!(a.server, "fs1");
        assert_eq!(b.server, "fs2");
        assert_eq!(c.server, "fs1");
    }

    #[test]
    fn test_unreachable_source_resolves_to_none() {
        let ctx = context_with(Arc::new(FakeReferralSource::failing()), user_creds(), true);
        let result = ctx
            .dfs()
            .resolve(&ctx, Some("corp"), Some("dfsroot"), Some("x"))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_cache_and_lookup_prefix() {
        let ctx = context_with(Arc::new(PanickingReferralSource), user_creds(), true);
        // Covers exactly "\server\share" of the request path.
        let referral = DfsReferral::new("target", "redirected", 13);

        ctx.dfs().cache(&ctx, r"\\server\share\sub", &referral);

        let hit = ctx
            .dfs()
            .lookup(r"\server\share\sub\deeper")
            .expect("cached referral should match prefix");
        assert_eq!(hit.server, "target");
        assert_eq!(hit.share, "redirected");
        assert_eq!(hit.path_consumed, 0);

        let other = ctx.dfs().lookup(r"\server\share\other").unwrap();
        assert_eq!(other.server, "target");

        // A different share does not match.
        assert!(ctx.dfs().lookup(r"\server\othershare\sub").is_none());
    }

    #[test]
    fn test_cache_malformed_unc_is_noop() {
        let ctx = context_with(Arc::new(PanickingReferralSource), user_creds(), true);
        let referral = DfsReferral::new("target", "share", 0);

        ctx.dfs().cache(&ctx, "not-a-unc-path", &referral);

        let cache = ctx.dfs().referrals.read().unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_disabled_is_noop() {
        let ctx = context_with(Arc::new(PanickingReferralSource), user_creds(), false);
        ctx.dfs()
            .cache(&ctx, r"\\server\share\sub", &DfsReferral::new("t", "s", 0));
        assert!(ctx.dfs().referrals.read().unwrap().is_empty());
    }

    #[test]
    fn test_trusted_domain_negative_paths() {
        // DFS disabled.
        let ctx = context_with(Arc::new(PanickingReferralSource), user_creds(), false);
        assert!(!ctx.dfs().is_trusted_domain(&ctx, "corp").unwrap());

        // Credentials without a domain.
        let ctx = context_with(
            Arc::new(PanickingReferralSource),
            Credentials::password("", "user", "pw"),
            true,
        );
        assert!(!ctx.dfs().is_trusted_domain(&ctx, "corp").unwrap());

        // Unreachable DC.
        let ctx = context_with(Arc::new(FakeReferralSource::failing()), user_creds(), true);
        assert!(!ctx.dfs().is_trusted_domain(&ctx, "corp").unwrap());

        // Misuse still errors.
        let ctx = context_with(Arc::new(PanickingReferralSource), user_creds(), true);
        assert!(ctx.dfs().is_trusted_domain(&ctx, "").is_err());
    }

    #[test]
    fn test_trusted_domain_positive() {
        let source = Arc::new(FakeReferralSource::with(
            "",
            vec![
                DfsReferral::new("CORP", "", 0),
                DfsReferral::new("europe.corp", "", 0),
            ],
        ));
        let ctx = context_with(source.clone(), user_creds(), true);

        assert!(ctx.dfs().is_trusted_domain(&ctx, "corp").unwrap());
        assert!(ctx.dfs().is_trusted_domain(&ctx, "EUROPE.CORP").unwrap());
        assert!(!ctx.dfs().is_trusted_domain(&ctx, "evil.example").unwrap());
        // Second round answered from the domain cache.
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_dc() {
        let source = Arc::new(FakeReferralSource::with(
            r"\corp",
            vec![DfsReferral::new("dc1.corp", "", 0)],
        ));
        let ctx = context_with(source, user_creds(), true);
        assert_eq!(
            ctx.dfs().get_dc(&ctx, "corp").unwrap(),
            Some("dc1.corp".to_string())
        );

        let ctx = context_with(Arc::new(FakeReferralSource::failing()), user_creds(), true);
        assert_eq!(ctx.dfs().get_dc(&ctx, "corp").unwrap(), None);

        let ctx = context_with(Arc::new(PanickingReferralSource), user_creds(), false);
        assert_eq!(ctx.dfs().get_dc(&ctx, "corp").unwrap(), None);
    }
}
