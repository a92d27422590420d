//! The node-addressed operation set a FUSE server dispatches into. One
//! `nodeid` addresses one file or directory; FUSE itself keeps the
//! lookup-count bookkeeping (`Forget`) so an implementation doesn't have to.

use std::time::Duration;

use super::fuse::Attr;

pub type NodeId = u64;
pub type Handle = u64;

pub type Result<T> = std::result::Result<T, i32>;

/// Caller identity and secapp context carried with every FUSE request.
#[derive(Debug, Copy, Clone, Default)]
pub struct Context {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// Extended attributes a creating process wants applied atomically (SELinux
/// labels and friends). The FUSE wire protocol this backend speaks never
/// populates this; it exists so the trait mirrors libfuse's shape.
#[derive(Debug, Default, Clone)]
pub struct SecContext {
    pub selinux: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub nodeid: NodeId,
    pub generation: u64,
    pub attr: Attr,
    pub entry_timeout: Duration,
    pub attr_timeout: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SetattrValid {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<(u64, u32)>,
    pub mtime: Option<(u64, u32)>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub offset: u64,
    pub kind: u32,
    pub name: Vec<u8>,
}

/// Operations a virtio-fs server dispatches FUSE requests into. Method names
/// match the opcode they serve.
pub trait Filesystem: Send + Sync {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn destroy(&self) {}

    fn lookup(&self, ctx: Context, parent: NodeId, name: &[u8]) -> Result<Entry>;

    fn forget(&self, ctx: Context, nodeid: NodeId, nlookup: u64);

    fn getattr(&self, ctx: Context, nodeid: NodeId, handle: Option<Handle>) -> Result<(Attr, Duration)>;

    fn setattr(
        &self,
        ctx: Context,
        nodeid: NodeId,
        valid: SetattrValid,
        handle: Option<Handle>,
    ) -> Result<(Attr, Duration)>;

    fn readlink(&self, ctx: Context, nodeid: NodeId) -> Result<Vec<u8>>;

    fn symlink(
        &self,
        ctx: Context,
        linkname: &[u8],
        parent: NodeId,
        name: &[u8],
        sec_ctx: SecContext,
    ) -> Result<Entry>;

    fn mknod(
        &self,
        ctx: Context,
        parent: NodeId,
        name: &[u8],
        mode: u32,
        rdev: u32,
        umask: u32,
        sec_ctx: SecContext,
    ) -> Result<Entry>;

    fn mkdir(
        &self,
        ctx: Context,
        parent: NodeId,
        name: &[u8],
        mode: u32,
        umask: u32,
        sec_ctx: SecContext,
    ) -> Result<Entry>;

    fn unlink(&self, ctx: Context, parent: NodeId, name: &[u8]) -> Result<()>;

    fn rmdir(&self, ctx: Context, parent: NodeId, name: &[u8]) -> Result<()>;

    fn rename(
        &self,
        ctx: Context,
        olddir: NodeId,
        oldname: &[u8],
        newdir: NodeId,
        newname: &[u8],
    ) -> Result<()>;

    fn open(&self, ctx: Context, nodeid: NodeId, flags: u32) -> Result<(Option<Handle>, u32)>;

    fn create(
        &self,
        ctx: Context,
        parent: NodeId,
        name: &[u8],
        mode: u32,
        flags: u32,
        umask: u32,
        sec_ctx: SecContext,
    ) -> Result<(Entry, Option<Handle>, u32)>;

    fn read(
        &self,
        ctx: Context,
        nodeid: NodeId,
        handle: Handle,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>>;

    fn write(
        &self,
        ctx: Context,
        nodeid: NodeId,
        handle: Handle,
        offset: u64,
        data: &[u8],
    ) -> Result<u32>;

    fn release(&self, ctx: Context, nodeid: NodeId, handle: Handle);

    fn opendir(&self, ctx: Context, nodeid: NodeId, flags: u32) -> Result<Option<Handle>>;

    fn readdir(
        &self,
        ctx: Context,
        nodeid: NodeId,
        handle: Handle,
        offset: u64,
    ) -> Result<Vec<DirEntry>>;

    fn releasedir(&self, ctx: Context, nodeid: NodeId, handle: Handle);

    fn fsync(&self, ctx: Context, nodeid: NodeId, handle: Handle, datasync: bool) -> Result<()>;

    fn getxattr(&self, ctx: Context, nodeid: NodeId, name: &[u8], size: u32) -> Result<Vec<u8>>;

    fn setxattr(
        &self,
        ctx: Context,
        nodeid: NodeId,
        name: &[u8],
        value: &[u8],
        flags: u32,
    ) -> Result<()>;

    fn listxattr(&self, ctx: Context, nodeid: NodeId, size: u32) -> Result<Vec<u8>>;

    fn removexattr(&self, ctx: Context, nodeid: NodeId, name: &[u8]) -> Result<()>;

    fn statfs(&self, ctx: Context, nodeid: NodeId) -> Result<StatFs> {
        let _ = (ctx, nodeid);
        Ok(StatFs::default())
    }
}
