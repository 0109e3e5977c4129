#![doc = include_str!("../docs/index.md")]
#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod context;
pub mod dfs;
pub mod error;
pub mod msg;
pub mod session;
pub mod transport;
pub mod tree;
pub mod tree_connection;
pub mod unc;

pub use auth::{AuthDecision, Credentials, Mechanism, SecurityContext};
pub use config::{AuthConfig, ClientConfig, DfsConfig};
pub use context::CifsContext;
pub use dfs::{DfsReferral, DfsResolver};
pub use error::Error;
pub use msg::{Dialect, NegotiateInfo, Request, Response, ShareType, Status};
pub use session::Session;
pub use transport::{Transport, TransportPool};
pub use tree::Tree;
pub use tree_connection::{SendOptions, TreeConnection};
pub use unc::UncPath;

pub use cifs_transport as wire;

/// SMB Result type
pub type Result<T> = std::result::Result<T, crate::Error>;
