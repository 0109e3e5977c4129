//! Authentication mechanism negotiation.
//!
//! The Kerberos-vs-NTLM choice is a pure decision table over the server's
//! advertised SPNEGO mechanisms, the local policy flags, and the kind of
//! credentials at hand — not virtual dispatch across authenticator types.
//! The mechanism-specific token exchanges themselves are opaque
//! [`SecurityContext`] objects supplied by a [`SecurityContextFactory`].

use std::fmt;

use crate::config::AuthConfig;
use crate::error::Error;

/// The Kerberos 5 mechanism OID.
pub const KERBEROS5_OID: &str = "1.2.840.113554.1.2.2";
/// The legacy Microsoft Kerberos 5 mechanism OID.
pub const MS_KERBEROS5_OID: &str = "1.2.840.48018.1.2.2";
/// The NTLMSSP mechanism OID.
pub const NTLMSSP_OID: &str = "1.3.6.1.4.1.311.2.2.10";

/// Whether an OID belongs to the Kerberos mechanism family.
pub fn is_kerberos_oid(oid: &str) -> bool {
    oid == KERBEROS5_OID || oid == MS_KERBEROS5_OID
}

/// The authentication mechanism selected for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Kerberos,
    Ntlm,
}

/// The outcome of mechanism negotiation.
pub struct AuthDecision {
    pub mechanism: Mechanism,
    /// Set when Kerberos credentials ended up on the NTLM path, whether
    /// forced by policy or because the server advertised no Kerberos.
    pub forced_fallback: bool,
    /// The security context driving the token exchange for the chosen
    /// mechanism.
    pub context: Box<dyn SecurityContext>,
}

impl fmt::Debug for AuthDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthDecision")
            .field("mechanism", &self.mechanism)
            .field("forced_fallback", &self.forced_fallback)
            .finish_non_exhaustive()
    }
}

/// What kind of principal the credentials represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Domain/user/password for NTLM.
    Password,
    /// A Kerberos principal with an obtainable ticket.
    Kerberos,
    Guest,
    Anonymous,
}

/// Client credentials: a cloneable value object.
///
/// Sessions take a defensive clone at construction, so later mutation of a
/// shared default-credentials object never leaks into live sessions.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    domain: String,
    username: String,
    secret: String,
    kind: CredentialKind,
    force_fallback: bool,
}

impl Credentials {
    /// Password credentials; the kind is guessed from the fields the way
    /// the classic clients do: empty everything is anonymous, user "guest"
    /// is a guest logon.
    pub fn password(domain: &str, username: &str, secret: &str) -> Self {
        let kind = if username.eq_ignore_ascii_case("guest") {
            CredentialKind::Guest
        } else if domain.is_empty() && username.is_empty() && secret.is_empty() {
            CredentialKind::Anonymous
        } else {
            CredentialKind::Password
        };
        Self {
            domain: domain.to_string(),
            username: username.to_string(),
            secret: secret.to_string(),
            kind,
            force_fallback: false,
        }
    }

    /// Credentials backed by a Kerberos principal.
    pub fn kerberos(realm: &str, username: &str, secret: &str) -> Self {
        Self {
            domain: realm.to_string(),
            username: username.to_string(),
            secret: secret.to_string(),
            kind: CredentialKind::Kerberos,
            force_fallback: false,
        }
    }

    pub fn anonymous() -> Self {
        Self::password("", "", "")
    }

    /// Forces the NTLM path even when the server advertises Kerberos.
    pub fn with_force_fallback(mut self, force: bool) -> Self {
        self.force_fallback = force;
        self
    }

    pub fn domain(&self) -> Option<&str> {
        if self.domain.is_empty() {
            None
        } else {
            Some(&self.domain)
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// The raw secret, for security-context factories. Never logged.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn kind(&self) -> CredentialKind {
        self.kind
    }

    pub fn is_anonymous(&self) -> bool {
        self.kind == CredentialKind::Anonymous
    }

    pub fn has_kerberos(&self) -> bool {
        self.kind == CredentialKind::Kerberos
    }

    pub fn force_fallback(&self) -> bool {
        self.force_fallback
    }

    /// Whether the given mechanism OID is a preferred one for these
    /// credentials: an anonymous principal prefers only NTLM, everything
    /// else prefers the Kerberos family.
    pub fn is_preferred_mech(&self, oid: &str) -> bool {
        if self.is_anonymous() {
            oid == NTLMSSP_OID
        } else {
            is_kerberos_oid(oid)
        }
    }

    /// Re-obtains backing credential material.
    ///
    /// Kerberos contexts have no self-renewal: the caller must
    /// re-authenticate instead, and this always fails for them. Password
    /// credentials need no refresh.
    pub fn refresh(&mut self) -> crate::Result<()> {
        match self.kind {
            CredentialKind::Kerberos => Err(Error::UnsupportedOperation(
                "Refreshing credentials is not supported by this authenticator".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The secret never reaches logs or error chains.
        f.debug_struct("Credentials")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// An in-progress mechanism-specific authentication exchange.
///
/// Token contents are produced and verified by the security layer; this
/// crate only moves them through session-setup rounds.
pub trait SecurityContext: fmt::Debug + Send {
    /// Consumes the peer's token (empty on the first round) and produces
    /// the next token to send.
    fn initialize(&mut self, input_token: &[u8]) -> crate::Result<Vec<u8>>;

    /// Whether the exchange has completed on our side.
    fn is_established(&self) -> bool;

    /// The established session key, for signing/sealing key derivation.
    fn session_key(&self) -> crate::Result<Vec<u8>>;

    /// Releases any resources the context holds.
    fn dispose(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

/// Creates [`SecurityContext`]s for the mechanism the negotiator picked.
pub trait SecurityContextFactory: Send + Sync + fmt::Debug {
    fn create(
        &self,
        mechanism: Mechanism,
        credentials: &Credentials,
        target_host: &str,
    ) -> crate::Result<Box<dyn SecurityContext>>;
}

/// Picks the authentication mechanism for a session, given the server's
/// advertised mechanism OIDs (from its SPNEGO NegTokenInit) and local
/// policy. Pure function; see [`negotiate`] for the context-building wrapper.
pub fn select_mechanism(
    credentials: &Credentials,
    policy: &AuthConfig,
    target_host: &str,
    advertised: &[String],
) -> crate::Result<(Mechanism, bool)> {
    let has = |pred: fn(&str) -> bool| advertised.iter().any(|oid| pred(oid));
    let ntlm_advertised = has(|oid| oid == NTLMSSP_OID);

    if credentials.has_kerberos() {
        // No service principal name can be built from a bare NetBIOS-style
        // name; reject before looking at mechanisms at all.
        if !target_host.contains('.') {
            return Err(Error::UnsupportedOperation(format!(
                "Cannot use netbios/short names with kerberos authentication, have {target_host}"
            )));
        }

        if credentials.force_fallback() {
            if !advertised.is_empty() && !ntlm_advertised {
                return Err(Error::UnsupportedOperation(
                    "Server does not support NTLM authentication".to_string(),
                ));
            }
            return Ok((Mechanism::Ntlm, true));
        }

        // An empty list means the server sent no initial token; proceed
        // optimistically with Kerberos, as the classic clients do.
        if advertised.is_empty() || has(is_kerberos_oid) {
            return Ok((Mechanism::Kerberos, false));
        }

        if policy.allow_ntlm_fallback && ntlm_advertised {
            log::debug!("Kerberos not advertised by server, falling back to NTLM");
            return Ok((Mechanism::Ntlm, true));
        }

        return Err(Error::UnsupportedOperation(
            "Server does not support kerberos authentication".to_string(),
        ));
    }

    // Raw NTLMSSP skips the SPNEGO wrapper, and with it the advertised
    // mechanism list.
    if policy.use_raw_ntlm {
        return Ok((Mechanism::Ntlm, false));
    }
    if !advertised.is_empty() && !ntlm_advertised {
        return Err(Error::UnsupportedOperation(
            "Server does not support NTLM authentication".to_string(),
        ));
    }
    Ok((Mechanism::Ntlm, false))
}

/// Runs [`select_mechanism`] and builds the matching security context.
pub fn negotiate(
    credentials: &Credentials,
    policy: &AuthConfig,
    factory: &dyn SecurityContextFactory,
    target_host: &str,
    advertised: &[String],
) -> crate::Result<AuthDecision> {
    let (mechanism, forced_fallback) =
        select_mechanism(credentials, policy, target_host, advertised)?;
    log::debug!(
        "Negotiated authentication mechanism {mechanism:?} for {target_host} (fallback: {forced_fallback})"
    );
    let context = factory.create(mechanism, credentials, target_host)?;
    Ok(AuthDecision {
        mechanism,
        forced_fallback,
        context,
    })
}
