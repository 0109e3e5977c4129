//! SMB 3.1.1 pre-authentication integrity hash chain.
//!
//! Every negotiate and session-setup message exchanged before session-key
//! derivation is folded into a running SHA-512: `hash' = H(hash || bytes)`.
//! The final value feeds key derivation, so a chain that missed or
//! double-counted a message produces keys the server will reject —
//! detecting downgrade or tampering of the handshake.

use sha2::{Digest, Sha512};

/// Size of the SHA-512 chain value.
pub const PREAUTH_HASH_SIZE: usize = 64;

/// The running chain value. Returned by value everywhere, so callers
/// always hold a copy they are free to mutate.
pub type PreauthHashValue = [u8; PREAUTH_HASH_SIZE];

/// State of a connection's pre-auth integrity chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreauthHashState {
    /// Live and accepting updates.
    InProgress(PreauthHashValue),
    /// Frozen at session-key derivation.
    Finished(PreauthHashValue),
    /// The negotiated dialect carries no pre-auth integrity.
    Unsupported,
    /// A mis-sequenced update poisoned the chain; the connection must be
    /// renegotiated before it can be trusted again.
    Invalid,
}

impl PreauthHashState {
    /// The zero-initialized chain, as it stands before the negotiate
    /// request is folded in.
    pub fn begin() -> Self {
        PreauthHashState::InProgress([0u8; PREAUTH_HASH_SIZE])
    }

    /// Folds one message into the chain. Updating a chain that is not in
    /// progress poisons it.
    #[must_use]
    pub fn next(self, data: &[u8]) -> Self {
        match self {
            PreauthHashState::InProgress(hash) => {
                PreauthHashState::InProgress(calculate_preauth_hash(&hash, data))
            }
            _ => PreauthHashState::Invalid,
        }
    }

    /// Freezes the chain for session-key derivation. Idempotent: a chain
    /// frozen once stays frozen at the same value.
    #[must_use]
    pub fn finish(self) -> Self {
        match self {
            PreauthHashState::InProgress(hash) | PreauthHashState::Finished(hash) => {
                PreauthHashState::Finished(hash)
            }
            _ => PreauthHashState::Invalid,
        }
    }

    /// The current chain value, if the chain is usable.
    pub fn value(&self) -> Option<PreauthHashValue> {
        match self {
            PreauthHashState::InProgress(hash) | PreauthHashState::Finished(hash) => Some(*hash),
            _ => None,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, PreauthHashState::InProgress(_))
    }
}

/// The chaining step: `H(previous || data)` with SHA-512.
///
/// Pure function of its inputs; identical inputs always produce the same
/// 64-byte output.
pub fn calculate_preauth_hash(previous: &PreauthHashValue, data: &[u8]) -> PreauthHashValue {
    let mut digest = Sha512::new();
    digest.update(previous);
    digest.update(data);
    digest.finalize().into()
}
