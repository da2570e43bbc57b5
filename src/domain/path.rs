//! Namespace paths
//!
//! Every path handed to a driver is absolute and `/`-separated. Normalization
//! rejects anything that could step outside the caller's namespace.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A normalized absolute path inside one identity's namespace
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NamespacePath(String);

impl NamespacePath {
    /// The namespace root, `/`
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Normalize a client-supplied path.
    ///
    /// Leading/trailing and repeated slashes are collapsed; `.` segments are
    /// dropped. `..`, NUL bytes and backslashes are rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    return Err(Error::BadInputData(format!(
                        "path must not contain '..': {}",
                        raw
                    )))
                }
                s if s.contains('\0') || s.contains('\\') => {
                    return Err(Error::BadInputData(format!("invalid path segment: {:?}", s)))
                }
                s => segments.push(s),
            }
        }
        if segments.is_empty() {
            return Ok(Self::root());
        }
        Ok(Self(format!("/{}", segments.join("/"))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path segments, empty for the root
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Final segment, `None` for the root
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            self.0.rsplit('/').next()
        }
    }

    /// Parent folder, `None` for the root
    pub fn parent(&self) -> Option<NamespacePath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Append a single child name
    pub fn join(&self, name: &str) -> Result<NamespacePath> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::BadInputData(format!("invalid child name: {:?}", name)));
        }
        if self.is_root() {
            Self::parse(name)
        } else {
            Self::parse(&format!("{}/{}", self.0, name))
        }
    }

    /// True when `self` is a strict ancestor of `other`
    pub fn is_ancestor_of(&self, other: &NamespacePath) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// Path relative to the root, without the leading slash
    pub fn relative(&self) -> &str {
        &self.0[1..]
    }

    /// Re-root `self` from `from` onto `to` (used by recursive moves)
    pub fn rebase(&self, from: &NamespacePath, to: &NamespacePath) -> Option<NamespacePath> {
        if self == from {
            return Some(to.clone());
        }
        if !from.is_ancestor_of(self) {
            return None;
        }
        let suffix = if from.is_root() {
            &self.0[1..]
        } else {
            &self.0[from.0.len() + 1..]
        };
        if to.is_root() {
            Self::parse(suffix).ok()
        } else {
            Self::parse(&format!("{}/{}", to.0, suffix)).ok()
        }
    }
}

impl fmt::Display for NamespacePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<NamespacePath> for String {
    fn from(p: NamespacePath) -> Self {
        p.0
    }
}

impl TryFrom<String> for NamespacePath {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl TryFrom<&str> for NamespacePath {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
