//! UNC path value type.

use std::fmt;
use std::str::FromStr;

use crate::Error;

/// A parsed UNC path: `\\server\share[\path]`.
///
/// The connection layer treats the path component as opaque; it only ever
/// splits it for DFS prefix matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UncPath {
    server: String,
    share: String,
    path: Option<String>,
}

impl UncPath {
    pub fn new(server: &str, share: &str) -> Self {
        Self {
            server: server.to_string(),
            share: share.to_string(),
            path: None,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn share(&self) -> &str {
        &self.share
    }

    /// The sub-share path, without a leading backslash.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns this path with the sub-share part replaced.
    pub fn with_path(mut self, path: &str) -> Self {
        let trimmed = path.trim_matches('\\');
        self.path = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    /// Returns this path reduced to `\\server\share`.
    pub fn with_no_path(mut self) -> Self {
        self.path = None;
        self
    }

    /// The `\\server\share` prefix as a string.
    pub fn share_root(&self) -> String {
        format!(r"\\{}\{}", self.server, self.share)
    }

    /// Character length of the `\server\share` part as counted by DFS
    /// `path_consumed` arithmetic (single leading backslash).
    pub fn dfs_prefix_len(&self) -> usize {
        1 + self.server.len() + 1 + self.share.len()
    }
}

impl FromStr for UncPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(r"\\")
            .ok_or_else(|| Error::InvalidArgument(format!("not a UNC path: {s}")))?;

        let mut parts = rest.splitn(3, '\\');
        let server = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("UNC path without a server: {s}")))?;
        let share = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("UNC path without a share: {s}")))?;
        let path = parts
            .next()
            .map(|p| p.trim_end_matches('\\'))
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        Ok(UncPath {
            server: server.to_string(),
            share: share.to_string(),
            path,
        })
    }
}

impl fmt::Display for UncPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r"\\{}\{}", self.server, self.share)?;
        if let Some(path) = &self.path {
            write!(f, r"\{path}")?;
        }
        Ok(())
    }
}
