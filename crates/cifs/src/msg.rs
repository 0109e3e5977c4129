//! The message codec seam.
//!
//! The binary encode/decode of SMB messages lives outside this crate. The
//! connection layer only ever handles *opaque* request/response objects
//! through the traits below: it stamps routing ids on them, moves their
//! bytes over the wire, folds those bytes into the pre-auth integrity
//! chain, and inspects response status codes. The handshake messages the
//! layer must originate itself (negotiate, session setup, tree connect,
//! logoff) are obtained from a [`MessageBuilder`] supplied by the codec.

use std::fmt;

/// An NT status code, as carried in SMB message headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    pub const SUCCESS: Status = Status(0x0000_0000);
    pub const PENDING: Status = Status(0x0000_0103);
    pub const MORE_PROCESSING_REQUIRED: Status = Status(0xC000_0016);
    pub const ACCESS_DENIED: Status = Status(0xC000_0022);
    pub const LOGON_FAILURE: Status = Status(0xC000_006D);
    pub const BAD_NETWORK_NAME: Status = Status(0xC000_00CC);
    pub const NETWORK_NAME_DELETED: Status = Status(0xC000_00C9);
    pub const USER_SESSION_DELETED: Status = Status(0xC000_0203);
    pub const PATH_NOT_COVERED: Status = Status(0xC000_0257);

    /// Whether the status signals success (severity bits clear).
    pub fn is_success(self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    pub fn is_error(self) -> bool {
        !self.is_success()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// SMB dialect revisions this layer can negotiate, oldest to newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dialect {
    /// Pre-SMB2 ("NT LM 0.12" family).
    Smb1,
    Smb0202,
    Smb021,
    Smb030,
    Smb0302,
    Smb0311,
}

impl Dialect {
    pub const MIN: Dialect = Dialect::Smb1;
    pub const MAX: Dialect = Dialect::Smb0311;

    /// Whether the dialect carries the pre-authentication integrity chain.
    pub fn has_preauth_integrity(self) -> bool {
        self >= Dialect::Smb0311
    }

    pub fn is_smb2(self) -> bool {
        self >= Dialect::Smb0202
    }
}

/// The type of resource a connected share exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareType {
    Disk,
    Pipe,
    Print,
}

/// The connection state fixed by the one-time negotiate exchange.
#[derive(Debug, Clone)]
pub struct NegotiateInfo {
    pub dialect: Dialect,
    /// Raw capability bits as advertised by the server.
    pub capabilities: u32,
    /// Whether message signing is required on this connection.
    pub signing_required: bool,
    /// Security mechanism OIDs from the server's SPNEGO NegTokenInit,
    /// in the server's preference order. Empty when the server sent no
    /// initial security blob.
    pub mechanisms: Vec<String>,
    /// The server's initial security token, handed to the first
    /// session-setup round when present.
    pub security_blob: Vec<u8>,
}

/// One SMB request going to the wire. Implemented by the codec layer;
/// opaque here apart from routing and retry handling.
pub trait Request: fmt::Debug + Send {
    /// Serializes the message for transmission.
    fn encode(&self) -> crate::Result<Vec<u8>>;

    /// Returns the message to its pre-send state, so a reconnect can
    /// retransmit it as if it had never been sent.
    fn reset(&mut self);

    /// Stamps the session the request travels under.
    fn set_session_id(&mut self, session_id: u64);

    /// Stamps the tree the request is directed at.
    fn set_tree_id(&mut self, tree_id: u32);

    /// Whether this request releases a server-side handle. Such requests
    /// must reach whatever tree currently holds the handle and are never
    /// re-routed through DFS or session re-validation.
    fn is_handle_release(&self) -> bool {
        false
    }
}

/// One SMB response read from the wire.
pub trait Response: fmt::Debug + Send {
    /// Parses the message from its wire form.
    fn decode(&mut self, bytes: &[u8]) -> crate::Result<()>;

    /// Returns the message to its pre-receive state.
    fn reset(&mut self);

    /// The status carried in the response header.
    fn status(&self) -> Status;

    /// Whether a response has been decoded into this object.
    fn is_received(&self) -> bool;
}

/// Negotiate response, additionally exposing the negotiated state.
pub trait NegotiateResponse: Response {
    fn info(&self) -> crate::Result<NegotiateInfo>;
}

/// Session-setup response: server-assigned session id plus the next
/// security token in the SPNEGO conversation.
pub trait SessionSetupResponse: Response {
    fn session_id(&self) -> u64;
    fn security_token(&self) -> &[u8];
}

/// Tree-connect response: server-assigned tree id and share properties.
pub trait TreeConnectResponse: Response {
    fn tree_id(&self) -> u32;
    fn share_type(&self) -> ShareType;
    /// Whether the share is part of a DFS namespace.
    fn is_dfs(&self) -> bool;
}

/// Factory for the handshake messages this layer originates. Supplied by
/// the codec; each call returns a paired request/response, ready for
/// [`crate::Transport::exchange`].
pub trait MessageBuilder: Send + Sync + fmt::Debug {
    fn negotiate(
        &self,
        config: &crate::ClientConfig,
        client_guid: [u8; 16],
    ) -> (Box<dyn Request>, Box<dyn NegotiateResponse>);

    fn session_setup(
        &self,
        security_token: &[u8],
    ) -> (Box<dyn Request>, Box<dyn SessionSetupResponse>);

    fn tree_connect(&self, unc_share: &str) -> (Box<dyn Request>, Box<dyn TreeConnectResponse>);

    fn tree_disconnect(&self) -> (Box<dyn Request>, Box<dyn Response>);

    fn logoff(&self) -> (Box<dyn Request>, Box<dyn Response>);
}
