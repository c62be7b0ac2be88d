use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read, Write};
use std::str::FromStr;
use std::sync::Mutex;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::backend::{
    Backend, BackendError, Codec, Context, DagNode, DirEntry, DirNode, FileBody, FileNode,
    NodeKind, ResolvedPath, UnixfsNode, WritableSession,
};
use crate::cid::Cid;
use crate::path::{LogicalPath, Namespace};

const READ_CHUNK: usize = 65535;

/// Structured node encoding. A block either decodes as one of these or is
/// an opaque raw leaf.
#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Node {
    File {
        data: String,
    },
    Dir {
        links: BTreeMap<String, String>,
    },
    Symlink {
        target: String,
    },
}

impl Node {
    fn encode(&self) -> Vec<u8> {
        // BTreeMap keeps link order stable, so equal trees encode to
        // equal bytes and therefore equal identifiers.
        serde_json::to_vec(self).unwrap_or_default()
    }

    fn decode(data: &[u8]) -> Option<Node> {
        serde_json::from_slice(data).ok()
    }
}

/// An in-memory merkle-DAG store with a process-local name table. Content
/// lives for the lifetime of the process.
pub struct MemDag {
    blocks: Mutex<HashMap<Cid, Vec<u8>>>,
    names: Mutex<HashMap<String, Cid>>,
}

impl MemDag {
    pub fn new() -> MemDag {
        MemDag {
            blocks: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
        }
    }

    pub fn put_block(&self, data: Vec<u8>) -> Cid {
        let cid = Cid::from_block(&data);
        let mut blocks = self.blocks.lock().unwrap();
        blocks.entry(cid.clone()).or_insert(data);
        cid
    }

    fn get_block(&self, cid: &Cid) -> Option<Vec<u8>> {
        let blocks = self.blocks.lock().unwrap();
        blocks.get(cid).cloned()
    }

    fn put_node(&self, node: &Node) -> Cid {
        self.put_block(node.encode())
    }

    fn get_node(&self, cid: &Cid) -> Result<Node, BackendError> {
        let data = self
            .get_block(cid)
            .ok_or_else(|| BackendError::NotFound(cid.to_string()))?;
        Node::decode(&data).ok_or(BackendError::NotDagNode)
    }

    /// Store raw bytes as a file node.
    pub fn add_file_bytes(&self, data: &[u8]) -> Cid {
        let cid = self.put_node(&Node::File {
            data: hex::encode(data),
        });
        info!("stored file node {} ({} bytes)", cid, data.len());
        cid
    }

    /// Store a directory node linking the given children.
    pub fn add_dir(&self, entries: &[(&str, Cid)]) -> Cid {
        let links = entries
            .iter()
            .map(|(name, cid)| (name.to_string(), cid.to_string()))
            .collect();
        self.put_node(&Node::Dir { links })
    }

    /// Point a mutable name at a root. Names resolve under `/ipns/`.
    pub fn publish(&self, name: &str, cid: &Cid) {
        let mut names = self.names.lock().unwrap();
        names.insert(name.to_string(), cid.clone());
    }

    fn node_size(&self, node: &Node) -> Option<u64> {
        match node {
            Node::File { data } => Some((data.len() / 2) as u64),
            Node::Symlink { target } => Some(target.len() as u64),
            Node::Dir { .. } => None,
        }
    }
}

impl Backend for MemDag {
    fn resolve_path(
        &self,
        ctx: &Context,
        path: &LogicalPath,
    ) -> Result<ResolvedPath, BackendError> {
        ctx.check()?;
        let mut cur = match path.namespace() {
            Namespace::Ipfs => Cid::from_str(path.root())
                .map_err(|_| BackendError::NotFound(path.root().to_string()))?,
            Namespace::Ipns => {
                let names = self.names.lock().unwrap();
                match names.get(path.root()) {
                    Some(v) => v.clone(),
                    // an unknown name is indistinguishable from an
                    // unreachable routing layer here
                    None => return Err(BackendError::Offline),
                }
            }
        };

        for seg in &path.segments()[1..] {
            ctx.check()?;
            let node = self.get_node(&cur)?;
            let links = match node {
                Node::Dir { links } => links,
                _ => return Err(BackendError::NoLink(seg.clone())),
            };
            let child = links
                .get(seg.as_str())
                .ok_or_else(|| BackendError::NoLink(seg.clone()))?;
            cur = Cid::from_str(child)
                .map_err(|_| BackendError::NotFound(child.clone()))?;
        }
        debug!("resolved {} -> {}", path, cur);
        Ok(ResolvedPath {
            path: path.clone(),
            cid: cur,
        })
    }

    fn unixfs_get(
        &self,
        ctx: &Context,
        resolved: &ResolvedPath,
    ) -> Result<UnixfsNode, BackendError> {
        ctx.check()?;
        let node = match self.get_node(&resolved.cid) {
            Ok(v) => v,
            Err(BackendError::NotDagNode) => return Ok(UnixfsNode::Unknown),
            Err(e) => return Err(e),
        };
        match node {
            Node::File { data } => {
                let bytes = hex::decode(&data)
                    .map_err(|e| BackendError::Other(format!("corrupt file node: {}", e)))?;
                Ok(UnixfsNode::File(FileNode {
                    size: Some(bytes.len() as u64),
                    body: FileBody::Seekable(Box::new(Cursor::new(bytes))),
                }))
            }
            Node::Dir { links } => {
                let mut rows: Vec<Result<DirEntry, BackendError>> = vec![];
                for (name, child) in links.iter() {
                    ctx.check()?;
                    let size = Cid::from_str(child)
                        .ok()
                        .and_then(|cid| self.get_node(&cid).ok())
                        .and_then(|node| self.node_size(&node));
                    rows.push(Ok(DirEntry {
                        name: name.clone(),
                        size,
                    }));
                }
                Ok(UnixfsNode::Directory(DirNode {
                    size: None,
                    entries: Box::new(rows.into_iter()),
                }))
            }
            Node::Symlink { target } => Ok(UnixfsNode::Symlink(target)),
        }
    }

    fn unixfs_add(
        &self,
        ctx: &Context,
        body: &mut dyn Read,
    ) -> Result<ResolvedPath, BackendError> {
        let mut data: Vec<u8> = vec![];
        let mut buf = [0u8; READ_CHUNK];
        loop {
            ctx.check()?;
            let n = body.read(&mut buf[..])?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        let cid = self.add_file_bytes(&data);
        Ok(ResolvedPath {
            path: LogicalPath::ipfs(&cid),
            cid,
        })
    }

    fn dag_get(&self, ctx: &Context, cid: &Cid) -> Result<DagNode, BackendError> {
        ctx.check()?;
        let data = self
            .get_block(cid)
            .ok_or_else(|| BackendError::NotFound(cid.to_string()))?;
        let codec = match Node::decode(&data) {
            Some(_) => Codec::DagNode,
            None => Codec::Raw,
        };
        Ok(DagNode {
            cid: cid.clone(),
            codec,
            data,
        })
    }

    fn raw_block(&self, ctx: &Context, cid: &Cid) -> Result<Vec<u8>, BackendError> {
        ctx.check()?;
        self.get_block(cid)
            .ok_or_else(|| BackendError::NotFound(cid.to_string()))
    }

    fn car_stream(
        &self,
        ctx: &Context,
        cid: &Cid,
        out: &mut dyn Write,
    ) -> Result<(), BackendError> {
        let header = serde_json::json!({ "version": 1, "roots": [cid.to_string()] });
        write_frame(out, header.to_string().as_bytes())?;

        let mut stack = vec![cid.clone()];
        while let Some(cur) = stack.pop() {
            ctx.check()?;
            let data = self
                .get_block(&cur)
                .ok_or_else(|| BackendError::NotFound(cur.to_string()))?;
            let frame = serde_json::json!({
                "cid": cur.to_string(),
                "data": hex::encode(&data),
            });
            write_frame(out, frame.to_string().as_bytes())?;
            if let Some(Node::Dir { links }) = Node::decode(&data) {
                // reverse so traversal pops children in link order
                for child in links.values().rev() {
                    if let Ok(cid) = Cid::from_str(child) {
                        stack.push(cid);
                    }
                }
            }
        }
        Ok(())
    }

    fn writable_session<'a>(
        &'a self,
        ctx: &Context,
        root: DagNode,
    ) -> Result<Box<dyn WritableSession + 'a>, BackendError> {
        let node = Node::decode(&root.data).ok_or(BackendError::NotDagNode)?;
        let links = match node {
            Node::Dir { links } => links,
            _ => return Err(BackendError::NotADirectory(root.cid.to_string())),
        };
        let mut tree: BTreeMap<String, TreeNode> = BTreeMap::new();
        for (name, child) in links {
            let cid = Cid::from_str(&child)
                .map_err(|_| BackendError::NotFound(child.clone()))?;
            tree.insert(name, TreeNode::Unexpanded(cid));
        }
        Ok(Box::new(MemSession {
            store: self,
            ctx: ctx.clone(),
            root: tree,
            finalized: None,
        }))
    }
}

/// One entry of the session's mutable overlay. Subtrees stay as bare
/// identifiers until an operation needs to descend into them.
enum TreeNode {
    Unexpanded(Cid),
    File(Cid),
    Symlink(Cid),
    Dir(BTreeMap<String, TreeNode>),
}

struct MemSession<'a> {
    store: &'a MemDag,
    ctx: Context,
    root: BTreeMap<String, TreeNode>,
    finalized: Option<Cid>,
}

fn expand(store: &MemDag, slot: &mut TreeNode) -> Result<(), BackendError> {
    let cid = match slot {
        TreeNode::Unexpanded(cid) => cid.clone(),
        _ => return Ok(()),
    };
    *slot = match store.get_node(&cid) {
        Ok(Node::Dir { links }) => {
            let mut children = BTreeMap::new();
            for (name, child) in links {
                let ccid = Cid::from_str(&child)
                    .map_err(|_| BackendError::NotFound(child.clone()))?;
                children.insert(name, TreeNode::Unexpanded(ccid));
            }
            TreeNode::Dir(children)
        }
        Ok(Node::Symlink { .. }) => TreeNode::Symlink(cid),
        // opaque leaves behave like files in the overlay
        Ok(Node::File { .. }) | Err(BackendError::NotDagNode) => TreeNode::File(cid),
        Err(e) => return Err(e),
    };
    Ok(())
}

fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|v| !v.is_empty()).collect()
}

/// Walk to the directory named by `segs`, optionally creating missing
/// entries along the way.
fn walk_dir<'t>(
    store: &MemDag,
    mut cur: &'t mut BTreeMap<String, TreeNode>,
    segs: &[&str],
    create: bool,
) -> Result<&'t mut BTreeMap<String, TreeNode>, BackendError> {
    for seg in segs {
        let slot = match cur.entry(seg.to_string()) {
            Entry::Occupied(o) => o.into_mut(),
            Entry::Vacant(v) => {
                if !create {
                    return Err(BackendError::NotFound(seg.to_string()));
                }
                v.insert(TreeNode::Dir(BTreeMap::new()))
            }
        };
        expand(store, slot)?;
        cur = match slot {
            TreeNode::Dir(children) => children,
            _ => return Err(BackendError::NotADirectory(seg.to_string())),
        };
    }
    Ok(cur)
}

fn freeze(store: &MemDag, node: &TreeNode) -> Cid {
    match node {
        TreeNode::Unexpanded(cid) | TreeNode::File(cid) | TreeNode::Symlink(cid) => cid.clone(),
        TreeNode::Dir(children) => freeze_dir(store, children),
    }
}

fn freeze_dir(store: &MemDag, children: &BTreeMap<String, TreeNode>) -> Cid {
    let links = children
        .iter()
        .map(|(name, child)| (name.clone(), freeze(store, child).to_string()))
        .collect();
    store.put_node(&Node::Dir { links })
}

fn write_frame(out: &mut dyn Write, payload: &[u8]) -> Result<(), BackendError> {
    out.write_all(&(payload.len() as u32).to_be_bytes())?;
    out.write_all(payload)?;
    Ok(())
}

impl<'a> WritableSession for MemSession<'a> {
    fn mkdir(&mut self, path: &str, make_parents: bool) -> Result<(), BackendError> {
        self.ctx.check()?;
        let segs = split_segments(path);
        if segs.is_empty() {
            return Ok(());
        }
        if make_parents {
            walk_dir(self.store, &mut self.root, &segs, true)?;
            return Ok(());
        }
        let parent = walk_dir(self.store, &mut self.root, &segs[..segs.len() - 1], false)?;
        walk_dir(self.store, parent, &segs[segs.len() - 1..], true)?;
        Ok(())
    }

    fn lookup(&mut self, path: &str) -> Result<NodeKind, BackendError> {
        self.ctx.check()?;
        let segs = split_segments(path);
        if segs.is_empty() {
            return Ok(NodeKind::Directory);
        }
        let parent = walk_dir(self.store, &mut self.root, &segs[..segs.len() - 1], false)?;
        let name = segs[segs.len() - 1];
        let slot = parent
            .get_mut(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        expand(self.store, slot)?;
        Ok(match slot {
            TreeNode::Dir(_) => NodeKind::Directory,
            TreeNode::Symlink(_) => NodeKind::Symlink,
            TreeNode::File(_) | TreeNode::Unexpanded(_) => NodeKind::File,
        })
    }

    fn add_child(&mut self, dir: &str, name: &str, cid: &Cid) -> Result<(), BackendError> {
        self.ctx.check()?;
        let parent = walk_dir(self.store, &mut self.root, &split_segments(dir), false)?;
        parent.insert(name.to_string(), TreeNode::Unexpanded(cid.clone()));
        self.finalized = None;
        Ok(())
    }

    fn unlink(&mut self, dir: &str, name: &str) -> Result<(), BackendError> {
        self.ctx.check()?;
        let parent = walk_dir(self.store, &mut self.root, &split_segments(dir), false)?;
        match parent.remove(name) {
            Some(_) => {
                self.finalized = None;
                Ok(())
            }
            None => Err(BackendError::NotFound(name.to_string())),
        }
    }

    fn finalize(&mut self) -> Result<Cid, BackendError> {
        self.ctx.check()?;
        if let Some(cid) = &self.finalized {
            return Ok(cid.clone());
        }
        let cid = freeze_dir(self.store, &self.root);
        debug!("finalized overlay root {}", cid);
        self.finalized = Some(cid.clone());
        Ok(cid)
    }
}
