use std::error::Error;
use std::fmt;
use std::io::{Read, Seek, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cid::Cid;
use crate::path::LogicalPath;

/// Request-scoped deadline and cancellation signal, handed to every backend
/// call. Backends are expected to check it at iteration boundaries and
/// abandon their work once it trips.
#[derive(Clone)]
pub struct Context {
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
}

impl Context {
    pub fn with_timeout(timeout: Duration) -> Context {
        Context {
            deadline: Instant::now() + timeout,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag the request as cancelled. Safe to call from another thread
    /// through a clone of the context.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn check(&self) -> Result<(), BackendError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(BackendError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(BackendError::DeadlineExceeded);
        }
        Ok(())
    }
}

/// Errors surfaced by the content-addressed backend. The HTTP edge maps
/// these onto status codes in exactly one place.
#[derive(Debug)]
pub enum BackendError {
    /// The backend cannot reach the network, or no route exists for a name.
    Offline,
    /// The request deadline elapsed inside the backend.
    DeadlineExceeded,
    /// The request was cancelled by the client going away.
    Cancelled,
    /// A path segment names a link the parent node does not have.
    NoLink(String),
    /// A block or node the backend was asked for does not exist.
    NotFound(String),
    /// The node is not a structured DAG node and cannot be traversed.
    NotDagNode,
    /// The operation needed a directory but found something else.
    NotADirectory(String),
    Io(std::io::Error),
    Other(String),
}

impl Error for BackendError {}

impl fmt::Display for BackendError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Offline => fmt.write_str("backend is offline or has no route"),
            BackendError::DeadlineExceeded => fmt.write_str("context deadline exceeded"),
            BackendError::Cancelled => fmt.write_str("request cancelled"),
            BackendError::NoLink(name) => write!(fmt, "no link named {}", name),
            BackendError::NotFound(what) => write!(fmt, "not found: {}", what),
            BackendError::NotDagNode => fmt.write_str("not a structured dag node"),
            BackendError::NotADirectory(path) => write!(fmt, "not a directory: {}", path),
            BackendError::Io(e) => write!(fmt, "io: {}", e),
            BackendError::Other(msg) => fmt.write_str(msg),
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> BackendError {
        BackendError::Io(e)
    }
}

/// A logical path paired with the identifier of the node it terminally
/// refers to. Only the backend's resolver creates these.
#[derive(Clone, Debug)]
pub struct ResolvedPath {
    pub path: LogicalPath,
    pub cid: Cid,
}

pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Concrete wrapper so a boxed seekable body satisfies plain `Read`/`Seek`
/// bounds again.
pub struct SeekableReader(pub Box<dyn ReadSeek + Send>);

impl Read for SeekableReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl Seek for SeekableReader {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.0.seek(pos)
    }
}

/// Byte source of a file node. Only seekable bodies can serve range
/// requests; plain streams are sent whole.
pub enum FileBody {
    Seekable(Box<dyn ReadSeek + Send>),
    Stream(Box<dyn Read + Send>),
}

pub struct FileNode {
    /// Byte length, if the backend knows it.
    pub size: Option<u64>,
    pub body: FileBody,
}

/// One row of a directory node, in link order.
pub struct DirEntry {
    pub name: String,
    /// Aggregate size of the child, if known.
    pub size: Option<u64>,
}

pub struct DirNode {
    /// Aggregate size of the directory, if known.
    pub size: Option<u64>,
    pub entries: Box<dyn Iterator<Item = Result<DirEntry, BackendError>> + Send>,
}

/// A node fetched through the UnixFS view of the DAG.
pub enum UnixfsNode {
    File(FileNode),
    Directory(DirNode),
    Symlink(String),
    Unknown,
}

/// Block codecs the gateway distinguishes. Writable operations only work
/// on structured nodes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Codec {
    DagNode,
    Raw,
}

/// A block fetched directly from the DAG store, with enough typing to tell
/// whether it can serve as a writable-session root.
pub struct DagNode {
    pub cid: Cid,
    pub codec: Codec,
    pub data: Vec<u8>,
}

/// Kinds a writable-session lookup can find.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
}

/// A transient, per-request mutable tree over an immutable DAG root.
///
/// Nothing is published; `finalize` writes the new blocks to the store and
/// returns the new root identifier. Finalize is idempotent, one call per
/// request is the expected use.
pub trait WritableSession {
    /// Create a directory at `path` below the root. With `make_parents`,
    /// missing intermediate directories are created too.
    fn mkdir(&mut self, path: &str, make_parents: bool) -> Result<(), BackendError>;

    /// Kind of the entry at `path`. The empty path names the root.
    fn lookup(&mut self, path: &str) -> Result<NodeKind, BackendError>;

    /// Link `cid` as `name` inside the directory at `dir`.
    fn add_child(&mut self, dir: &str, name: &str, cid: &Cid) -> Result<(), BackendError>;

    /// Remove `name` from the directory at `dir`. Returns `NotFound` if no
    /// such entry exists; callers decide whether that matters.
    fn unlink(&mut self, dir: &str, name: &str) -> Result<(), BackendError>;

    fn finalize(&mut self) -> Result<Cid, BackendError>;
}

/// The content-addressed store the gateway fronts.
pub trait Backend: Send + Sync {
    /// Resolve a logical path to the node it terminally refers to.
    fn resolve_path(&self, ctx: &Context, path: &LogicalPath)
        -> Result<ResolvedPath, BackendError>;

    /// Fetch the UnixFS view of a resolved node.
    fn unixfs_get(&self, ctx: &Context, resolved: &ResolvedPath)
        -> Result<UnixfsNode, BackendError>;

    /// Import a byte stream as a new file, returning its path.
    fn unixfs_add(&self, ctx: &Context, body: &mut dyn Read)
        -> Result<ResolvedPath, BackendError>;

    /// Fetch a block as a typed DAG node.
    fn dag_get(&self, ctx: &Context, cid: &Cid) -> Result<DagNode, BackendError>;

    /// Raw bytes of a single block.
    fn raw_block(&self, ctx: &Context, cid: &Cid) -> Result<Vec<u8>, BackendError>;

    /// Write a linear archive of the DAG rooted at `cid`: roots header
    /// first, then blocks in traversal order.
    fn car_stream(&self, ctx: &Context, cid: &Cid, out: &mut dyn Write)
        -> Result<(), BackendError>;

    /// Open a mutable overlay rooted at a structured DAG node.
    fn writable_session<'a>(
        &'a self,
        ctx: &Context,
        root: DagNode,
    ) -> Result<Box<dyn WritableSession + 'a>, BackendError>;
}
