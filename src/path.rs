use std::error::Error;
use std::fmt;
use std::str::FromStr;

use crate::cid::{Cid, CidError};

pub const IPFS_PATH_PREFIX: &str = "/ipfs/";
pub const IPNS_PATH_PREFIX: &str = "/ipns/";

/// The two namespaces a logical path can live in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Namespace {
    /// Immutable, content-addressed.
    Ipfs,
    /// Mutable naming layer, resolution may change over time.
    Ipns,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Ipfs => "ipfs",
            Namespace::Ipns => "ipns",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq)]
pub enum PathError {
    /// Path does not start with a known namespace prefix.
    BadNamespace,
    /// Nothing follows the namespace prefix.
    NoRoot,
    /// The first segment of an immutable path is not a content identifier.
    BadRoot(CidError),
}

impl Error for PathError {}

impl fmt::Display for PathError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathError::BadNamespace => fmt.write_str("path must begin with /ipfs/ or /ipns/"),
            PathError::NoRoot => fmt.write_str("path is missing a root segment"),
            PathError::BadRoot(e) => write!(fmt, "bad root segment: {}", e),
        }
    }
}

/// An absolute, cleaned gateway path: a namespace followed by one or more
/// segments, the first of which is a content identifier (for `/ipfs/`) or a
/// routable name (for `/ipns/`).
#[derive(Clone, PartialEq, Debug)]
pub struct LogicalPath {
    namespace: Namespace,
    segments: Vec<String>,
}

impl FromStr for LogicalPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<LogicalPath, PathError> {
        let (namespace, rest) = if let Some(r) = s.strip_prefix(IPFS_PATH_PREFIX) {
            (Namespace::Ipfs, r)
        } else if let Some(r) = s.strip_prefix(IPNS_PATH_PREFIX) {
            (Namespace::Ipns, r)
        } else {
            return Err(PathError::BadNamespace);
        };

        let segments: Vec<String> = rest
            .split('/')
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
            .collect();
        if segments.is_empty() {
            return Err(PathError::NoRoot);
        }
        if namespace == Namespace::Ipfs {
            Cid::from_str(&segments[0]).map_err(PathError::BadRoot)?;
        }
        Ok(LogicalPath {
            namespace,
            segments,
        })
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "/{}/{}", self.namespace, self.segments.join("/"))
    }
}

impl LogicalPath {
    /// The immutable path naming a root node directly.
    pub fn ipfs(cid: &Cid) -> LogicalPath {
        LogicalPath {
            namespace: Namespace::Ipfs,
            segments: vec![cid.to_string()],
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// True iff resolving this path twice may yield different results.
    pub fn mutable(&self) -> bool {
        self.namespace == Namespace::Ipns
    }

    /// All segments following the namespace prefix, root included.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    /// The path extended by one more segment.
    pub fn join(&self, name: &str) -> LogicalPath {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        LogicalPath {
            namespace: self.namespace,
            segments,
        }
    }

    /// Every non-empty prefix of the path, shortest first. The last entry
    /// is the path itself.
    pub fn prefixes(&self) -> Vec<LogicalPath> {
        (1..=self.segments.len())
            .map(|n| LogicalPath {
                namespace: self.namespace,
                segments: self.segments[..n].to_vec(),
            })
            .collect()
    }

    /// Default download filename: the last path segment, unless the path is
    /// a bare namespace root. A name in `/ipns/<name>` is not a filename.
    pub fn filename(&self) -> Option<&str> {
        if self.segments.len() < 2 {
            return None;
        }
        self.segments.last().map(|v| v.as_str())
    }
}

/// A writable-mode target: an existing immutable root plus the path of the
/// entry to create or remove inside it.
pub struct WritePath {
    pub root: Cid,
    /// Slash-separated path below the root; empty when the request names
    /// the bare root, which writable operations reject.
    pub interior: String,
}

impl FromStr for WritePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<WritePath, PathError> {
        let rest = s.strip_prefix(IPFS_PATH_PREFIX).ok_or(PathError::BadNamespace)?;
        let segments: Vec<&str> = rest.split('/').filter(|v| !v.is_empty()).collect();
        if segments.is_empty() {
            return Err(PathError::NoRoot);
        }
        let root = Cid::from_str(segments[0]).map_err(PathError::BadRoot)?;
        Ok(WritePath {
            root,
            interior: segments[1..].join("/"),
        })
    }
}

impl WritePath {
    /// Split the interior path into its parent directory and final name.
    pub fn dir_and_name(&self) -> (&str, &str) {
        match self.interior.rfind('/') {
            Some(idx) => (&self.interior[..idx], &self.interior[idx + 1..]),
            None => ("", self.interior.as_str()),
        }
    }
}

/// Join URL path parts, skipping empty ones and collapsing separators.
pub fn join_url(parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
        for seg in part.split('/').filter(|v| !v.is_empty()) {
            out.push('/');
            out.push_str(seg);
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}
