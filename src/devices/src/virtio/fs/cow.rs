//! Copy-on-write FUSE backend: a node graph held entirely in memory, where
//! every node optionally delegates reads it has not locally overwritten to
//! an immutable "abstract backing" (normally a layer of the container image
//! filesystem). Writes always land in an in-memory overlay and never touch
//! the backing, so a backing directory or layer stack is never mutated by
//! guest activity.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::filesystem::{Context, DirEntry, Entry, Filesystem, NodeId, Result, SecContext, SetattrValid, StatFs};
use super::fuse::Attr;
use super::NfsInfo;

const ATTR_TIMEOUT: Duration = Duration::from_secs(1);
const ENTRY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
}

/// A read-only view into an immutable layer the overlay has not shadowed
/// yet. The layered container filesystem (C7) provides the real
/// implementation; `DirBacking` below is a standalone implementation over a
/// host directory, used when no layer stack is configured.
pub trait AbstractNode: Send + Sync {
    fn kind(&self) -> NodeKind;
    fn size(&self) -> u64;
    fn mode(&self) -> u32;
    fn mtime(&self) -> u64;
    fn read(&self, offset: u64, len: u32) -> Vec<u8>;
    fn readlink(&self) -> Vec<u8>;
    fn lookup(&self, name: &[u8]) -> Option<Arc<dyn AbstractNode>>;
    fn readdir(&self) -> Vec<(Vec<u8>, Arc<dyn AbstractNode>)>;
}

/// An `AbstractNode` backed directly by a real directory on the host.
pub struct DirBacking {
    path: PathBuf,
}

impl DirBacking {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DirBacking { path: path.into() }
    }
}

impl AbstractNode for DirBacking {
    fn kind(&self) -> NodeKind {
        match std::fs::symlink_metadata(&self.path) {
            Ok(md) if md.is_dir() => NodeKind::Dir,
            Ok(md) if md.file_type().is_symlink() => NodeKind::Symlink,
            _ => NodeKind::File,
        }
    }

    fn size(&self) -> u64 {
        std::fs::symlink_metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    fn mode(&self) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        std::fs::symlink_metadata(&self.path)
            .map(|m| m.permissions().mode())
            .unwrap_or(0o644)
    }

    fn mtime(&self) -> u64 {
        std::fs::symlink_metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn read(&self, offset: u64, len: u32) -> Vec<u8> {
        use std::io::{Read, Seek, SeekFrom};
        let mut buf = vec![0u8; len as usize];
        let Ok(mut f) = std::fs::File::open(&self.path) else {
            return Vec::new();
        };
        if f.seek(SeekFrom::Start(offset)).is_err() {
            return Vec::new();
        }
        let n = f.read(&mut buf).unwrap_or(0);
        buf.truncate(n);
        buf
    }

    fn readlink(&self) -> Vec<u8> {
        std::fs::read_link(&self.path)
            .map(|p| p.into_os_string().into_encoded_bytes())
            .unwrap_or_default()
    }

    fn lookup(&self, name: &[u8]) -> Option<Arc<dyn AbstractNode>> {
        let name = std::str::from_utf8(name).ok()?;
        let child = self.path.join(name);
        std::fs::symlink_metadata(&child).ok()?;
        Some(Arc::new(DirBacking::new(child)))
    }

    fn readdir(&self) -> Vec<(Vec<u8>, Arc<dyn AbstractNode>)> {
        let mut out = Vec::new();
        let Ok(rd) = std::fs::read_dir(&self.path) else {
            return out;
        };
        for entry in rd.flatten() {
            let name = entry.file_name().into_encoded_bytes();
            out.push((name, Arc::new(DirBacking::new(entry.path())) as Arc<dyn AbstractNode>));
        }
        out
    }
}

#[derive(Debug, Clone)]
struct OverlayBlock {
    offset: u64,
    data: Vec<u8>,
}

impl OverlayBlock {
    fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

struct Node {
    kind: NodeKind,
    mode: u32,
    uid: u32,
    gid: u32,
    atime: u64,
    mtime: u64,
    ctime: u64,
    size: u64,
    rdev: u32,

    backing: Option<Arc<dyn AbstractNode>>,
    blocks: Vec<OverlayBlock>,

    entries: Option<HashMap<Vec<u8>, NodeId>>,
    deleted: Option<HashSet<Vec<u8>>>,

    symlink_target: Vec<u8>,
    xattrs: HashMap<Vec<u8>, Vec<u8>>,

    parent: NodeId,
    name: Vec<u8>,

    lookup_count: u64,
    handles: u64,
    unlinked: bool,
}

impl Node {
    fn new_dir(parent: NodeId, name: Vec<u8>, mode: u32, uid: u32, gid: u32) -> Self {
        let now = now_secs();
        Node {
            kind: NodeKind::Dir,
            mode: mode | libc::S_IFDIR as u32,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
            size: 0,
            rdev: 0,
            backing: None,
            blocks: Vec::new(),
            entries: Some(HashMap::new()),
            deleted: Some(HashSet::new()),
            symlink_target: Vec::new(),
            xattrs: HashMap::new(),
            parent,
            name,
            lookup_count: 0,
            handles: 0,
            unlinked: false,
        }
    }

    fn new_file(parent: NodeId, name: Vec<u8>, mode: u32, uid: u32, gid: u32, rdev: u32) -> Self {
        let now = now_secs();
        let kind = if mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32 {
            NodeKind::Symlink
        } else {
            NodeKind::File
        };
        Node {
            kind,
            mode,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
            size: 0,
            rdev,
            backing: None,
            blocks: Vec::new(),
            entries: None,
            deleted: None,
            symlink_target: Vec::new(),
            xattrs: HashMap::new(),
            parent,
            name,
            lookup_count: 0,
            handles: 0,
            unlinked: false,
        }
    }

    fn from_backing(parent: NodeId, name: Vec<u8>, backing: Arc<dyn AbstractNode>) -> Self {
        let now = now_secs();
        let kind = backing.kind();
        let mode = backing.mode()
            | match kind {
                NodeKind::Dir => libc::S_IFDIR as u32,
                NodeKind::Symlink => libc::S_IFLNK as u32,
                NodeKind::File => libc::S_IFREG as u32,
            };
        Node {
            kind,
            mode,
            uid: 0,
            gid: 0,
            atime: backing.mtime(),
            mtime: backing.mtime(),
            ctime: backing.mtime(),
            size: backing.size(),
            rdev: 0,
            entries: matches!(kind, NodeKind::Dir).then(HashMap::new),
            deleted: matches!(kind, NodeKind::Dir).then(HashSet::new),
            symlink_target: if kind == NodeKind::Symlink {
                backing.readlink()
            } else {
                Vec::new()
            },
            xattrs: HashMap::new(),
            backing: Some(backing),
            blocks: Vec::new(),
            parent,
            name,
            lookup_count: 0,
            handles: 0,
            unlinked: false,
        }
    }

    fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    fn attr(&self, nodeid: NodeId) -> Attr {
        Attr {
            ino: nodeid,
            size: self.size,
            blocks: (self.size + 511) / 512,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            atimensec: 0,
            mtimensec: 0,
            ctimensec: 0,
            mode: self.mode,
            nlink: if self.is_dir() { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            blksize: 4096,
            padding: 0,
        }
    }

    /// Reads `len` bytes starting at `offset`, compositing overlay blocks
    /// over the abstract backing (overlay wins on overlap).
    fn read(&self, offset: u64, len: u32) -> Vec<u8> {
        let avail = self.size.saturating_sub(offset).min(len as u64) as usize;
        if avail == 0 {
            return Vec::new();
        }
        let mut out = if let Some(backing) = &self.backing {
            let mut base = backing.read(offset, avail as u32);
            base.resize(avail, 0);
            base
        } else {
            vec![0u8; avail]
        };
        for block in &self.blocks {
            if block.end() <= offset || block.offset >= offset + avail as u64 {
                continue;
            }
            let start = block.offset.max(offset);
            let end = block.end().min(offset + avail as u64);
            let src_off = (start - block.offset) as usize;
            let dst_off = (start - offset) as usize;
            let n = (end - start) as usize;
            out[dst_off..dst_off + n].copy_from_slice(&block.data[src_off..src_off + n]);
        }
        out
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        let new_block = OverlayBlock {
            offset,
            data: data.to_vec(),
        };
        let end = new_block.end();
        let insert_at = self.blocks.partition_point(|b| b.offset < new_block.offset);

        let mut merged = new_block;
        let mut i = insert_at;
        // Merge with the block before if it abuts/overlaps.
        if i > 0 && self.blocks[i - 1].end() >= merged.offset {
            i -= 1;
        }
        let mut drained: Vec<OverlayBlock> = Vec::new();
        while i < self.blocks.len() && self.blocks[i].offset <= merged.end().max(end) {
            if self.blocks[i].end() < merged.offset {
                i += 1;
                continue;
            }
            drained.push(self.blocks.remove(i));
        }
        for block in drained {
            merged = coalesce(merged, block);
        }
        let pos = self.blocks.partition_point(|b| b.offset < merged.offset);
        self.blocks.insert(pos, merged);

        self.size = self.size.max(offset + data.len() as u64);
        self.mtime = now_secs();
    }

    fn truncate(&mut self, new_size: u64) {
        self.blocks.retain_mut(|b| {
            if b.offset >= new_size {
                return false;
            }
            if b.end() > new_size {
                b.data.truncate((new_size - b.offset) as usize);
            }
            true
        });
        self.size = new_size;
    }
}

fn coalesce(a: OverlayBlock, b: OverlayBlock) -> OverlayBlock {
    let start = a.offset.min(b.offset);
    let end = a.end().max(b.end());
    let mut data = vec![0u8; (end - start) as usize];
    data[(a.offset - start) as usize..(a.offset - start) as usize + a.data.len()].copy_from_slice(&a.data);
    data[(b.offset - start) as usize..(b.offset - start) as usize + b.data.len()].copy_from_slice(&b.data);
    OverlayBlock { offset: start, data }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct CowFs {
    nodes: Mutex<HashMap<NodeId, Node>>,
    next_id: AtomicU64,
    root_backing: Option<Arc<dyn AbstractNode>>,
    #[allow(dead_code)]
    nfs_info: Option<NfsInfo>,
}

impl CowFs {
    pub fn new(shared_dir: String, nfs_info: Option<NfsInfo>) -> std::io::Result<CowFs> {
        let root_backing: Option<Arc<dyn AbstractNode>> = if shared_dir.is_empty() {
            None
        } else {
            Some(Arc::new(DirBacking::new(shared_dir)))
        };
        Ok(CowFs::with_backing(root_backing, nfs_info))
    }

    pub fn with_backing(root_backing: Option<Arc<dyn AbstractNode>>, nfs_info: Option<NfsInfo>) -> CowFs {
        let mut nodes = HashMap::new();
        let mut root = Node::new_dir(super::fuse::FUSE_ROOT_ID, Vec::new(), 0o755, 0, 0);
        root.backing = root_backing.clone();
        if root_backing.is_some() {
            root.entries = Some(HashMap::new());
            root.deleted = Some(HashSet::new());
        }
        nodes.insert(super::fuse::FUSE_ROOT_ID, root);
        CowFs {
            nodes: Mutex::new(nodes),
            next_id: AtomicU64::new(super::fuse::FUSE_ROOT_ID + 1),
            root_backing,
            nfs_info,
        }
    }

    fn alloc_id(&self) -> NodeId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn maybe_collect(nodes: &mut HashMap<NodeId, Node>, id: NodeId) {
        if id == super::fuse::FUSE_ROOT_ID {
            return;
        }
        if let Some(node) = nodes.get(&id) {
            if node.unlinked && node.lookup_count == 0 && node.handles == 0 {
                nodes.remove(&id);
            }
        }
    }
}

impl Filesystem for CowFs {
    fn lookup(&self, _ctx: Context, parent: NodeId, name: &[u8]) -> Result<Entry> {
        let mut nodes = self.nodes.lock().unwrap();
        let parent_node = nodes.get(&parent).ok_or(libc::ENOENT)?;

        if let Some(entries) = &parent_node.entries {
            if let Some(&child) = entries.get(name) {
                nodes.get_mut(&child).unwrap().lookup_count += 1;
                let attr = nodes[&child].attr(child);
                return Ok(Entry {
                    nodeid: child,
                    generation: 0,
                    attr,
                    entry_timeout: ENTRY_TIMEOUT,
                    attr_timeout: ATTR_TIMEOUT,
                });
            }
            if parent_node
                .deleted
                .as_ref()
                .map(|d| d.contains(name))
                .unwrap_or(false)
            {
                return Err(libc::ENOENT);
            }
        }

        let backing = parent_node.backing.clone().ok_or(libc::ENOENT)?;
        let child_backing = backing.lookup(name).ok_or(libc::ENOENT)?;

        let id = self.alloc_id();
        let node = Node::from_backing(parent, name.to_vec(), child_backing);
        let attr = node.attr(id);
        nodes.insert(id, node);
        nodes.get_mut(&id).unwrap().lookup_count += 1;
        nodes
            .get_mut(&parent)
            .unwrap()
            .entries
            .get_or_insert_with(HashMap::new)
            .insert(name.to_vec(), id);

        Ok(Entry {
            nodeid: id,
            generation: 0,
            attr,
            entry_timeout: ENTRY_TIMEOUT,
            attr_timeout: ATTR_TIMEOUT,
        })
    }

    fn forget(&self, _ctx: Context, nodeid: NodeId, nlookup: u64) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get_mut(&nodeid) {
            node.lookup_count = node.lookup_count.saturating_sub(nlookup);
        }
        Self::maybe_collect(&mut nodes, nodeid);
    }

    fn getattr(&self, _ctx: Context, nodeid: NodeId, _handle: Option<u64>) -> Result<(Attr, Duration)> {
        let nodes = self.nodes.lock().unwrap();
        let node = nodes.get(&nodeid).ok_or(libc::ENOENT)?;
        Ok((node.attr(nodeid), ATTR_TIMEOUT))
    }

    fn setattr(
        &self,
        _ctx: Context,
        nodeid: NodeId,
        valid: SetattrValid,
        _handle: Option<u64>,
    ) -> Result<(Attr, Duration)> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(&nodeid).ok_or(libc::ENOENT)?;

        if let Some(mode) = valid.mode {
            node.mode = (node.mode & libc::S_IFMT as u32) | (mode & !(libc::S_IFMT as u32));
        }
        if let Some(uid) = valid.uid {
            node.uid = uid;
        }
        if let Some(gid) = valid.gid {
            node.gid = gid;
        }
        if let Some(size) = valid.size {
            node.truncate(size);
        }
        if let Some((secs, _nsec)) = valid.atime {
            node.atime = secs;
        }
        if let Some((secs, _nsec)) = valid.mtime {
            node.mtime = secs;
        }
        node.ctime = now_secs();

        Ok((node.attr(nodeid), ATTR_TIMEOUT))
    }

    fn readlink(&self, _ctx: Context, nodeid: NodeId) -> Result<Vec<u8>> {
        let nodes = self.nodes.lock().unwrap();
        let node = nodes.get(&nodeid).ok_or(libc::ENOENT)?;
        Ok(node.symlink_target.clone())
    }

    fn symlink(
        &self,
        ctx: Context,
        linkname: &[u8],
        parent: NodeId,
        name: &[u8],
        _sec_ctx: SecContext,
    ) -> Result<Entry> {
        let id = self.new_child(parent, name, 0o777, ctx, |parent_node| {
            let mut node = Node::new_file(parent, name.to_vec(), 0o777 | libc::S_IFLNK as u32, ctx.uid, ctx.gid, 0);
            node.symlink_target = linkname.to_vec();
            node.size = linkname.len() as u64;
            let _ = parent_node;
            node
        })?;
        let mut nodes = self.nodes.lock().unwrap();
        let attr = nodes[&id].attr(id);
        nodes.get_mut(&id).unwrap().lookup_count += 1;
        Ok(Entry {
            nodeid: id,
            generation: 0,
            attr,
            entry_timeout: ENTRY_TIMEOUT,
            attr_timeout: ATTR_TIMEOUT,
        })
    }

    fn mknod(
        &self,
        ctx: Context,
        parent: NodeId,
        name: &[u8],
        mode: u32,
        rdev: u32,
        umask: u32,
        _sec_ctx: SecContext,
    ) -> Result<Entry> {
        let id = self.new_child(parent, name, mode, ctx, |_| {
            Node::new_file(parent, name.to_vec(), mode & !umask, ctx.uid, ctx.gid, rdev)
        })?;
        let mut nodes = self.nodes.lock().unwrap();
        let attr = nodes[&id].attr(id);
        nodes.get_mut(&id).unwrap().lookup_count += 1;
        Ok(Entry {
            nodeid: id,
            generation: 0,
            attr,
            entry_timeout: ENTRY_TIMEOUT,
            attr_timeout: ATTR_TIMEOUT,
        })
    }

    fn mkdir(
        &self,
        ctx: Context,
        parent: NodeId,
        name: &[u8],
        mode: u32,
        umask: u32,
        _sec_ctx: SecContext,
    ) -> Result<Entry> {
        let id = self.new_child(parent, name, mode, ctx, |_| {
            Node::new_dir(parent, name.to_vec(), mode & !umask, ctx.uid, ctx.gid)
        })?;
        let mut nodes = self.nodes.lock().unwrap();
        let attr = nodes[&id].attr(id);
        nodes.get_mut(&id).unwrap().lookup_count += 1;
        Ok(Entry {
            nodeid: id,
            generation: 0,
            attr,
            entry_timeout: ENTRY_TIMEOUT,
            attr_timeout: ATTR_TIMEOUT,
        })
    }

    fn unlink(&self, _ctx: Context, parent: NodeId, name: &[u8]) -> Result<()> {
        self.remove_entry(parent, name, false)
    }

    fn rmdir(&self, _ctx: Context, parent: NodeId, name: &[u8]) -> Result<()> {
        self.remove_entry(parent, name, true)
    }

    fn rename(&self, _ctx: Context, olddir: NodeId, oldname: &[u8], newdir: NodeId, newname: &[u8]) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();

        let child_id = nodes
            .get(&olddir)
            .and_then(|p| p.entries.as_ref())
            .and_then(|e| e.get(oldname).copied())
            .ok_or(libc::ENOENT)?;

        if let Some(existing) = nodes
            .get(&newdir)
            .and_then(|p| p.entries.as_ref())
            .and_then(|e| e.get(newname).copied())
        {
            if existing != child_id {
                let was_dir = nodes[&existing].is_dir();
                Self::detach(&mut nodes, newdir, newname, was_dir);
            }
        }

        nodes.get_mut(&olddir).unwrap().entries.as_mut().unwrap().remove(oldname);
        if let Some(backing) = nodes[&olddir].backing.clone() {
            if backing.lookup(oldname).is_some() {
                nodes.get_mut(&olddir).unwrap().deleted.as_mut().unwrap().insert(oldname.to_vec());
            }
        }

        nodes
            .get_mut(&newdir)
            .unwrap()
            .entries
            .get_or_insert_with(HashMap::new)
            .insert(newname.to_vec(), child_id);
        nodes.get_mut(&newdir).unwrap().deleted.get_or_insert_with(HashSet::new).remove(newname);

        let child = nodes.get_mut(&child_id).unwrap();
        child.parent = newdir;
        child.name = newname.to_vec();
        child.ctime = now_secs();

        Ok(())
    }

    fn open(&self, _ctx: Context, nodeid: NodeId, _flags: u32) -> Result<(Option<u64>, u32)> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(&nodeid).ok_or(libc::ENOENT)?;
        node.handles += 1;
        Ok((Some(nodeid), 0))
    }

    fn create(
        &self,
        ctx: Context,
        parent: NodeId,
        name: &[u8],
        mode: u32,
        _flags: u32,
        umask: u32,
        _sec_ctx: SecContext,
    ) -> Result<(Entry, Option<u64>, u32)> {
        let id = self.new_child(parent, name, mode, ctx, |_| {
            Node::new_file(parent, name.to_vec(), (mode & !umask) | libc::S_IFREG as u32, ctx.uid, ctx.gid, 0)
        })?;
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(&id).unwrap();
        node.lookup_count += 1;
        node.handles += 1;
        let attr = node.attr(id);
        Ok((
            Entry {
                nodeid: id,
                generation: 0,
                attr,
                entry_timeout: ENTRY_TIMEOUT,
                attr_timeout: ATTR_TIMEOUT,
            },
            Some(id),
            0,
        ))
    }

    fn read(&self, _ctx: Context, nodeid: NodeId, _handle: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let nodes = self.nodes.lock().unwrap();
        let node = nodes.get(&nodeid).ok_or(libc::ENOENT)?;
        Ok(node.read(offset, size))
    }

    fn write(&self, _ctx: Context, nodeid: NodeId, _handle: u64, offset: u64, data: &[u8]) -> Result<u32> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(&nodeid).ok_or(libc::ENOENT)?;
        node.write(offset, data);
        Ok(data.len() as u32)
    }

    fn release(&self, _ctx: Context, nodeid: NodeId, _handle: u64) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get_mut(&nodeid) {
            node.handles = node.handles.saturating_sub(1);
        }
        Self::maybe_collect(&mut nodes, nodeid);
    }

    fn opendir(&self, _ctx: Context, nodeid: NodeId, _flags: u32) -> Result<Option<u64>> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(&nodeid).ok_or(libc::ENOENT)?;
        if !node.is_dir() {
            return Err(libc::ENOTDIR);
        }
        node.handles += 1;
        Ok(Some(nodeid))
    }

    fn readdir(&self, _ctx: Context, nodeid: NodeId, _handle: u64, offset: u64) -> Result<Vec<DirEntry>> {
        let nodes = self.nodes.lock().unwrap();
        let node = nodes.get(&nodeid).ok_or(libc::ENOENT)?;
        if !node.is_dir() {
            return Err(libc::ENOTDIR);
        }

        let mut all: Vec<(Vec<u8>, u64, u32)> = vec![
            (b".".to_vec(), nodeid, libc::DT_DIR as u32),
            (b"..".to_vec(), node.parent, libc::DT_DIR as u32),
        ];

        if let Some(entries) = &node.entries {
            for (name, &child) in entries {
                let dtype = nodes.get(&child).map(dtype_of).unwrap_or(libc::DT_UNKNOWN as u32);
                all.push((name.clone(), child, dtype));
            }
        }

        if let Some(backing) = &node.backing {
            let deleted = node.deleted.as_ref();
            for (name, child_backing) in backing.readdir() {
                if node.entries.as_ref().map(|e| e.contains_key(&name)).unwrap_or(false) {
                    continue;
                }
                if deleted.map(|d| d.contains(&name)).unwrap_or(false) {
                    continue;
                }
                let dtype = match child_backing.kind() {
                    NodeKind::Dir => libc::DT_DIR,
                    NodeKind::Symlink => libc::DT_LNK,
                    NodeKind::File => libc::DT_REG,
                } as u32;
                all.push((name, 0, dtype));
            }
        }

        Ok(all
            .into_iter()
            .enumerate()
            .skip(offset as usize)
            .map(|(i, (name, ino, kind))| DirEntry {
                ino,
                offset: (i + 1) as u64,
                kind,
                name,
            })
            .collect())
    }

    fn releasedir(&self, ctx: Context, nodeid: NodeId, handle: u64) {
        self.release(ctx, nodeid, handle)
    }

    fn fsync(&self, _ctx: Context, _nodeid: NodeId, _handle: u64, _datasync: bool) -> Result<()> {
        Ok(())
    }

    fn getxattr(&self, _ctx: Context, nodeid: NodeId, name: &[u8], size: u32) -> Result<Vec<u8>> {
        let nodes = self.nodes.lock().unwrap();
        let node = nodes.get(&nodeid).ok_or(libc::ENOENT)?;
        let value = node.xattrs.get(name).ok_or(libc::ENODATA)?;
        if size != 0 && value.len() as u32 > size {
            return Err(libc::ERANGE);
        }
        Ok(value.clone())
    }

    fn setxattr(&self, _ctx: Context, nodeid: NodeId, name: &[u8], value: &[u8], _flags: u32) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(&nodeid).ok_or(libc::ENOENT)?;
        node.xattrs.insert(name.to_vec(), value.to_vec());
        Ok(())
    }

    fn listxattr(&self, _ctx: Context, nodeid: NodeId, size: u32) -> Result<Vec<u8>> {
        let nodes = self.nodes.lock().unwrap();
        let node = nodes.get(&nodeid).ok_or(libc::ENOENT)?;
        let mut out = Vec::new();
        for key in node.xattrs.keys() {
            out.extend_from_slice(key);
            out.push(0);
        }
        if size != 0 && out.len() as u32 > size {
            return Err(libc::ERANGE);
        }
        Ok(out)
    }

    fn removexattr(&self, _ctx: Context, nodeid: NodeId, name: &[u8]) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(&nodeid).ok_or(libc::ENOENT)?;
        node.xattrs.remove(name).ok_or(libc::ENODATA)?;
        Ok(())
    }

    fn statfs(&self, _ctx: Context, _nodeid: NodeId) -> Result<StatFs> {
        Ok(StatFs {
            blocks: 1 << 20,
            bfree: 1 << 19,
            bavail: 1 << 19,
            files: 1 << 16,
            ffree: 1 << 15,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }
}

/// A single path observed while walking the nodes an overlay has
/// materialized (looked up, created, written, or deleted). The container
/// image layering machinery turns a sequence of these into a new
/// filesystem layer that composes on top of layers the overlay's backing
/// already represents.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub path: Vec<u8>,
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    pub content: Vec<u8>,
    pub linkname: Vec<u8>,
    pub deleted: bool,
}

impl CowFs {
    /// Walks every node currently materialized in the overlay and returns
    /// one `WalkEntry` per path, parents before children. Paths the guest
    /// never touched are not included, since they are already present in
    /// whatever layer backs this overlay.
    pub fn capture(&self) -> Vec<WalkEntry> {
        let nodes = self.nodes.lock().unwrap();
        let mut out = Vec::new();
        self.walk(&nodes, super::fuse::FUSE_ROOT_ID, Vec::new(), &mut out);
        out
    }

    fn walk(&self, nodes: &HashMap<NodeId, Node>, id: NodeId, prefix: Vec<u8>, out: &mut Vec<WalkEntry>) {
        let Some(node) = nodes.get(&id) else { return };

        if id != super::fuse::FUSE_ROOT_ID {
            out.push(WalkEntry {
                path: prefix.clone(),
                kind: node.kind,
                mode: node.mode,
                uid: node.uid,
                gid: node.gid,
                mtime: node.mtime,
                content: if node.kind == NodeKind::File {
                    node.read(0, u32::MAX)
                } else {
                    Vec::new()
                },
                linkname: node.symlink_target.clone(),
                deleted: false,
            });
        }

        if let Some(deleted) = &node.deleted {
            for name in deleted {
                let mut path = prefix.clone();
                push_component(&mut path, name);
                out.push(WalkEntry {
                    path,
                    kind: NodeKind::File,
                    mode: 0,
                    uid: 0,
                    gid: 0,
                    mtime: 0,
                    content: Vec::new(),
                    linkname: Vec::new(),
                    deleted: true,
                });
            }
        }

        if let Some(entries) = &node.entries {
            for (name, &child) in entries {
                let mut path = prefix.clone();
                push_component(&mut path, name);
                self.walk(nodes, child, path, out);
            }
        }
    }
}

fn push_component(path: &mut Vec<u8>, name: &[u8]) {
    if !path.is_empty() {
        path.push(b'/');
    }
    path.extend_from_slice(name);
}

fn dtype_of(node: &Node) -> u32 {
    (match node.kind {
        NodeKind::Dir => libc::DT_DIR,
        NodeKind::Symlink => libc::DT_LNK,
        NodeKind::File => libc::DT_REG,
    }) as u32
}

impl CowFs {
    fn new_child(
        &self,
        parent: NodeId,
        name: &[u8],
        _mode: u32,
        _ctx: Context,
        build: impl FnOnce(&Node) -> Node,
    ) -> Result<NodeId> {
        let mut nodes = self.nodes.lock().unwrap();
        {
            let parent_node = nodes.get(&parent).ok_or(libc::ENOENT)?;
            if !parent_node.is_dir() {
                return Err(libc::ENOTDIR);
            }
            if parent_node.entries.as_ref().map(|e| e.contains_key(name)).unwrap_or(false) {
                return Err(libc::EEXIST);
            }
        }
        let parent_node = nodes.get(&parent).unwrap();
        let node = build(parent_node);
        let id = self.alloc_id();
        nodes.insert(id, node);

        let parent_node = nodes.get_mut(&parent).unwrap();
        parent_node.entries.get_or_insert_with(HashMap::new).insert(name.to_vec(), id);
        if let Some(deleted) = &mut parent_node.deleted {
            deleted.remove(name);
        }
        parent_node.mtime = now_secs();

        Ok(id)
    }

    fn remove_entry(&self, parent: NodeId, name: &[u8], want_dir: bool) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let child_id = {
            let parent_node = nodes.get(&parent).ok_or(libc::ENOENT)?;
            parent_node
                .entries
                .as_ref()
                .and_then(|e| e.get(name).copied())
                .or_else(|| {
                    parent_node
                        .backing
                        .as_ref()
                        .and_then(|b| b.lookup(name).map(|_| 0))
                })
                .ok_or(libc::ENOENT)?
        };

        if want_dir {
            if child_id != 0 {
                let child = nodes.get(&child_id).ok_or(libc::ENOENT)?;
                if !child.is_dir() {
                    return Err(libc::ENOTDIR);
                }
                let empty = child.entries.as_ref().map(|e| e.is_empty()).unwrap_or(true)
                    && child
                        .backing
                        .as_ref()
                        .map(|b| {
                            b.readdir()
                                .iter()
                                .all(|(n, _)| child.deleted.as_ref().map(|d| d.contains(n)).unwrap_or(false))
                        })
                        .unwrap_or(true);
                if !empty {
                    return Err(libc::ENOTEMPTY);
                }
            }
        } else if child_id != 0 && nodes[&child_id].is_dir() {
            return Err(libc::EISDIR);
        }

        Self::detach(&mut nodes, parent, name, want_dir);
        Ok(())
    }

    fn detach(nodes: &mut HashMap<NodeId, Node>, parent: NodeId, name: &[u8], _is_dir: bool) {
        let child_id = nodes.get(&parent).and_then(|p| p.entries.as_ref()).and_then(|e| e.get(name).copied());

        if let Some(child_id) = child_id {
            nodes.get_mut(&parent).unwrap().entries.as_mut().unwrap().remove(name);
        }

        let parent_has_name = nodes[&parent]
            .backing
            .as_ref()
            .map(|b| b.lookup(name).is_some())
            .unwrap_or(false);
        if parent_has_name {
            nodes.get_mut(&parent).unwrap().deleted.get_or_insert_with(HashSet::new).insert(name.to_vec());
        }

        if let Some(child_id) = child_id {
            if let Some(child) = nodes.get_mut(&child_id) {
                child.unlinked = true;
            }
            Self::maybe_collect(nodes, child_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context { uid: 0, gid: 0, pid: 1 }
    }

    fn root_fs() -> CowFs {
        CowFs::with_backing(None, None)
    }

    #[test]
    fn create_and_read_back() {
        let fs = root_fs();
        let (entry, handle, _) = fs
            .create(ctx(), super::super::fuse::FUSE_ROOT_ID, b"hello.txt", 0o644, 0, 0, SecContext::default())
            .unwrap();
        let h = handle.unwrap();
        fs.write(ctx(), entry.nodeid, h, 0, b"hello world").unwrap();
        let data = fs.read(ctx(), entry.nodeid, h, 0, 32).unwrap();
        assert_eq!(&data, b"hello world");
    }

    #[test]
    fn write_is_cow_over_backing() {
        let dir = std::env::temp_dir().join(format!("cowfs-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("t.txt");
        std::fs::write(&file, b"original data").unwrap();

        let fs = CowFs::new(dir.to_string_lossy().into_owned(), None).unwrap();
        let entry = fs.lookup(ctx(), super::super::fuse::FUSE_ROOT_ID, b"t.txt").unwrap();
        let (handle, _) = fs.open(ctx(), entry.nodeid, 0).unwrap();
        let h = handle.unwrap();

        let before = fs.read(ctx(), entry.nodeid, h, 0, 64).unwrap();
        assert_eq!(&before, b"original data");

        fs.write(ctx(), entry.nodeid, h, 0, b"modified content from CoW layer").unwrap();
        let after = fs.read(ctx(), entry.nodeid, h, 0, 64).unwrap();
        assert_eq!(&after, b"modified content from CoW layer");

        let on_disk = std::fs::read(&file).unwrap();
        assert_eq!(on_disk, b"original data");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rmdir_requires_empty() {
        let fs = root_fs();
        fs.mkdir(ctx(), super::super::fuse::FUSE_ROOT_ID, b"d", 0o755, 0, SecContext::default())
            .unwrap();
        let entry = fs.lookup(ctx(), super::super::fuse::FUSE_ROOT_ID, b"d").unwrap();
        fs.mkdir(ctx(), entry.nodeid, b"inner", 0o755, 0, SecContext::default()).unwrap();
        assert_eq!(
            fs.rmdir(ctx(), super::super::fuse::FUSE_ROOT_ID, b"d").unwrap_err(),
            libc::ENOTEMPTY
        );
    }
}
