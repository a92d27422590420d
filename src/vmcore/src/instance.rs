//! C9: the instance façade. File operations call straight into the fs
//! backend (C4) through the node table FUSE itself would dispatch into;
//! command execution rides the guest's vsock channel the same way the
//! Linux virtio-fs client or `vinit`'s own accept loop would see it.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use devices::virtio::fs::{
    AbstractNode, Attr, Context as FsContext, CowFs, DirEntry as FuseDirEnt, Filesystem, Handle,
    NodeId, SecContext, Server, SetattrValid, FUSE_ROOT_ID,
};
use devices::virtio::{VirtioDevice, VsockChannel, VsockDevice, VsockShared};
use guestchan::Frame;
use vm_memory::{Bytes, GuestAddress};
use vmm::vmm_config::fs::{FsBuilder, FsConfigError, FsDeviceConfig};
use vmm::{RunningVm, VmSession};
use vmm_ids::VmmShutdownSignal;

use crate::{Error, Result};

const MAX_SYMLINK_HOPS: u32 = 40;
const BOOT_TIMEOUT: Duration = Duration::from_secs(30);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;
const S_IFDIR: u32 = 0o040000;

/// Where an instance's root filesystem comes from.
pub enum InstanceSource {
    /// A layered container image, already restored by C7/C8.
    Layered(Arc<dyn AbstractNode>),
    /// A bare host directory mounted read-write with no overlay. Used by
    /// tests that don't need a real image.
    HostDir(String),
}

/// Memory size, fs tag, and kernel image for a not-yet-booted instance.
/// Mirrors the teacher's one-struct-per-concern `vmm_config` pattern.
#[derive(Clone)]
pub struct InstanceOpts {
    pub fs_id: String,
    pub mem_size: u64,
    pub kernel: Arc<Vec<u8>>,
}

/// A file opened through [`Instance::open`]/[`Instance::create`]. Carries
/// the FUSE-level handle and its node id for subsequent read/write/close.
pub struct OpenFile {
    nodeid: NodeId,
    handle: Option<Handle>,
}

/// The result of running a program inside the instance via its vsock
/// command channel.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A program invocation, built up with [`Instance::command`] and run with
/// [`Command::run`].
pub struct Command<'a> {
    instance: &'a Instance,
    path: String,
    argv: Vec<String>,
    env: Vec<(String, String)>,
    cwd: String,
}

impl<'a> Command<'a> {
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn run(self) -> Result<CommandOutput> {
        self.instance.run_command(&self.path, &self.argv, &self.env, &self.cwd)
    }
}

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

pub struct Instance {
    id: u64,
    vm: Option<RunningVm>,
    fs: Arc<Server<CowFs>>,
    vsock: Arc<VsockShared>,
    closed: bool,
}

impl Instance {
    /// Boots a VM over `source`'s root and waits for `vinit` to announce
    /// readiness on the boot vsock port.
    pub fn new(source: InstanceSource, opts: InstanceOpts) -> Result<Self> {
        crate::init_logger_once();

        let fs_config = match source {
            InstanceSource::Layered(root) => FsDeviceConfig {
                fs_id: opts.fs_id.clone(),
                shared_dir: String::new(),
                nfs_info: None,
                root: Some(root),
            },
            InstanceSource::HostDir(dir) => FsDeviceConfig {
                fs_id: opts.fs_id.clone(),
                shared_dir: dir,
                nfs_info: None,
                root: None,
            },
        };

        let fs_device = FsBuilder::create_fs(fs_config).map_err(|FsConfigError::CreateFsDevice(e)| Error::Fs(e))?;
        let fs = fs_device.server_handle();

        let vsock_device = VsockDevice::new();
        let vsock = vsock_device.shared();

        let devices: Vec<Box<dyn VirtioDevice>> = vec![Box::new(fs_device), Box::new(vsock_device)];

        let shutdown = VmmShutdownSignal::new();
        let session = VmSession::new(opts.mem_size, devices, shutdown)?;

        let entry = GuestAddress(arch::aarch64::layout::KERNEL_ENTRY_ADDR);
        session.guest_mem().write_slice(&opts.kernel, entry)?;

        let vm = session.boot(entry)?;

        let instance = Instance {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            vm: Some(vm),
            fs,
            vsock,
            closed: false,
        };

        let boot = VsockChannel::connect(instance.vsock.clone(), guestchan::BOOT_PORT, BOOT_TIMEOUT)?;
        let raw = boot.recv_until_closed(BOOT_TIMEOUT)?;
        match decode_frame(&raw)? {
            Frame::BootComplete => {}
            other => return Err(Error::Protocol(format!("unexpected boot frame: {other:?}"))),
        }

        Ok(instance)
    }

    fn filesystem(&self) -> &CowFs {
        self.fs.filesystem()
    }

    /// Host-issued file operations act with root identity; the guest's own
    /// processes are what get their own uid/gid via `Command`'s env.
    fn ctx() -> FsContext {
        FsContext { uid: 0, gid: 0, pid: 0 }
    }

    fn root_attr(&self) -> Result<Attr> {
        let (attr, _) = self.filesystem().getattr(Self::ctx(), FUSE_ROOT_ID, None).map_err(Error::Errno)?;
        Ok(attr)
    }

    /// Walks `path` component by component from the root, honoring
    /// symlinks along the way. `follow_last` controls whether a symlink at
    /// the final component is itself followed (true for `Stat`/`Open`/
    /// `ReadFile`, false for `Lstat`/`Remove`/`Symlink`/`Rename`).
    fn resolve(&self, path: &str, follow_last: bool) -> Result<(NodeId, Attr)> {
        let mut nodeid = FUSE_ROOT_ID;
        let mut attr = self.root_attr()?;
        let mut remaining: VecDeque<String> = split_components(path);
        let mut hops = 0u32;

        while let Some(name) = remaining.pop_front() {
            let entry = self
                .filesystem()
                .lookup(Self::ctx(), nodeid, name.as_bytes())
                .map_err(Error::Errno)?;
            nodeid = entry.nodeid;
            attr = entry.attr;

            let is_last = remaining.is_empty();
            if attr.mode & S_IFMT == S_IFLNK && (!is_last || follow_last) {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(Error::SymlinkLoop);
                }
                let target = self.filesystem().readlink(Self::ctx(), nodeid).map_err(Error::Errno)?;
                let target = String::from_utf8_lossy(&target).into_owned();
                let mut target_components = split_components(&target);
                if target.starts_with('/') {
                    nodeid = FUSE_ROOT_ID;
                    attr = self.root_attr()?;
                    remaining = target_components;
                } else {
                    target_components.append(&mut remaining);
                    remaining = target_components;
                }
            }
        }

        Ok((nodeid, attr))
    }

    fn resolve_parent(&self, path: &str) -> Result<(NodeId, String)> {
        let (dir, name) = split_parent(path);
        let (nodeid, _) = self.resolve(&dir, true)?;
        Ok((nodeid, name))
    }

    pub fn stat(&self, path: &str) -> Result<Attr> {
        Ok(self.resolve(path, true)?.1)
    }

    pub fn lstat(&self, path: &str) -> Result<Attr> {
        Ok(self.resolve(path, false)?.1)
    }

    pub fn open(&self, path: &str, flags: u32) -> Result<OpenFile> {
        let (nodeid, _) = self.resolve(path, true)?;
        let (handle, _) = self.filesystem().open(Self::ctx(), nodeid, flags).map_err(Error::Errno)?;
        Ok(OpenFile { nodeid, handle })
    }

    pub fn create(&self, path: &str, mode: u32, flags: u32) -> Result<OpenFile> {
        let (parent, name) = self.resolve_parent(path)?;
        let (entry, handle, _) = self
            .filesystem()
            .create(Self::ctx(), parent, name.as_bytes(), mode, flags, 0o022, SecContext::default())
            .map_err(Error::Errno)?;
        Ok(OpenFile { nodeid: entry.nodeid, handle })
    }

    pub fn read(&self, file: &OpenFile, offset: u64, size: u32) -> Result<Vec<u8>> {
        let handle = file.handle.unwrap_or(0);
        self.filesystem()
            .read(Self::ctx(), file.nodeid, handle, offset, size)
            .map_err(Error::Errno)
    }

    pub fn write(&self, file: &OpenFile, offset: u64, data: &[u8]) -> Result<u32> {
        let handle = file.handle.unwrap_or(0);
        self.filesystem()
            .write(Self::ctx(), file.nodeid, handle, offset, data)
            .map_err(Error::Errno)
    }

    pub fn close(&self, file: OpenFile) {
        if let Some(handle) = file.handle {
            self.filesystem().release(Self::ctx(), file.nodeid, handle);
        }
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let (nodeid, attr) = self.resolve(path, true)?;
        let (handle, _) = self.filesystem().open(Self::ctx(), nodeid, libc::O_RDONLY as u32).map_err(Error::Errno)?;
        let handle = handle.unwrap_or(0);
        let data = self
            .filesystem()
            .read(Self::ctx(), nodeid, handle, 0, attr.size.max(1) as u32)
            .map_err(Error::Errno)?;
        self.filesystem().release(Self::ctx(), nodeid, handle);
        Ok(data)
    }

    pub fn write_file(&self, path: &str, data: &[u8], perm: u32) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let flags = (libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC) as u32;
        let (entry, handle, _) = self
            .filesystem()
            .create(Self::ctx(), parent, name.as_bytes(), perm, flags, 0o022, SecContext::default())
            .map_err(Error::Errno)?;
        let handle = handle.unwrap_or(0);
        self.filesystem().write(Self::ctx(), entry.nodeid, handle, 0, data).map_err(Error::Errno)?;
        self.filesystem().release(Self::ctx(), entry.nodeid, handle);
        Ok(())
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        self.filesystem()
            .mkdir(Self::ctx(), parent, name.as_bytes(), mode, 0o022, SecContext::default())
            .map_err(Error::Errno)?;
        Ok(())
    }

    pub fn mkdir_all(&self, path: &str, mode: u32) -> Result<()> {
        let mut built = String::new();
        for component in split_components(path) {
            built.push('/');
            built.push_str(&component);
            match self.mkdir(&built, mode) {
                Ok(()) => {}
                Err(Error::Errno(e)) if e == libc::EEXIST => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn symlink(&self, target: &str, link_path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(link_path)?;
        self.filesystem()
            .symlink(Self::ctx(), target.as_bytes(), parent, name.as_bytes(), SecContext::default())
            .map_err(Error::Errno)?;
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        let (nodeid, _) = self.resolve(path, false)?;
        let target = self.filesystem().readlink(Self::ctx(), nodeid).map_err(Error::Errno)?;
        Ok(String::from_utf8_lossy(&target).into_owned())
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let (olddir, oldname) = self.resolve_parent(old_path)?;
        let (newdir, newname) = self.resolve_parent(new_path)?;
        self.filesystem()
            .rename(Self::ctx(), olddir, oldname.as_bytes(), newdir, newname.as_bytes())
            .map_err(Error::Errno)?;
        Ok(())
    }

    /// A no-op on a nonexistent path (success), matching the FUSE-dirent
    /// walk's behavior: removing something that was never there leaves the
    /// filesystem in the caller's desired end state.
    pub fn remove(&self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        match self.filesystem().unlink(Self::ctx(), parent, name.as_bytes()) {
            Ok(()) => Ok(()),
            Err(e) if e == libc::ENOENT => Ok(()),
            Err(libc::EISDIR) => {
                self.filesystem().rmdir(Self::ctx(), parent, name.as_bytes()).map_err(Error::Errno)
            }
            Err(e) => Err(Error::Errno(e)),
        }
    }

    /// Recursively removes `path`. Built on [`Filesystem::readdir`]'s
    /// already-decoded `DirEntry` records rather than re-parsing the FUSE
    /// wire dirent layout byte-for-byte — this façade calls the backend
    /// in-process, so there is no wire buffer to parse, only the same
    /// ino/offset/type/name fields already typed out.
    pub fn remove_all(&self, path: &str) -> Result<()> {
        let (nodeid, attr) = match self.resolve(path, false) {
            Ok(v) => v,
            Err(Error::Errno(e)) if e == libc::ENOENT => return Ok(()),
            Err(e) => return Err(e),
        };

        if attr.mode & S_IFMT == S_IFDIR {
            for entry in self.list_dir(nodeid)? {
                if entry.name == b"." || entry.name == b".." {
                    continue;
                }
                let child_path = join_path(path, &String::from_utf8_lossy(&entry.name));
                self.remove_all(&child_path)?;
            }
        }
        self.remove(path)
    }

    fn list_dir(&self, nodeid: NodeId) -> Result<Vec<FuseDirEnt>> {
        let handle = self.filesystem().opendir(Self::ctx(), nodeid, 0).map_err(Error::Errno)?.unwrap_or(0);
        let entries = self.filesystem().readdir(Self::ctx(), nodeid, handle, 0).map_err(Error::Errno);
        self.filesystem().releasedir(Self::ctx(), nodeid, handle);
        entries
    }

    pub fn read_dir(&self, path: &str) -> Result<Vec<String>> {
        let (nodeid, _) = self.resolve(path, true)?;
        Ok(self
            .list_dir(nodeid)?
            .into_iter()
            .map(|e| String::from_utf8_lossy(&e.name).into_owned())
            .filter(|n| n != "." && n != "..")
            .collect())
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let (nodeid, _) = self.resolve(path, true)?;
        let valid = SetattrValid { mode: Some(mode), ..Default::default() };
        self.filesystem().setattr(Self::ctx(), nodeid, valid, None).map_err(Error::Errno)?;
        Ok(())
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let (nodeid, _) = self.resolve(path, true)?;
        let valid = SetattrValid { uid: Some(uid), gid: Some(gid), ..Default::default() };
        self.filesystem().setattr(Self::ctx(), nodeid, valid, None).map_err(Error::Errno)?;
        Ok(())
    }

    pub fn chtimes(&self, path: &str, atime_sec: u64, mtime_sec: u64) -> Result<()> {
        let (nodeid, _) = self.resolve(path, true)?;
        let valid = SetattrValid {
            atime: Some((atime_sec, 0)),
            mtime: Some((mtime_sec, 0)),
            ..Default::default()
        };
        self.filesystem().setattr(Self::ctx(), nodeid, valid, None).map_err(Error::Errno)?;
        Ok(())
    }

    /// Begins building a program invocation, run over the guest's command
    /// vsock channel (C6) once [`Command::run`] is called.
    pub fn command(&self, path: impl Into<String>) -> Command<'_> {
        Command {
            instance: self,
            path: path.into(),
            argv: Vec::new(),
            env: Vec::new(),
            cwd: "/".to_string(),
        }
    }

    /// Equivalent to `command(path).args(args).run()`.
    pub fn command_context(&self, path: &str, args: &[String]) -> Result<CommandOutput> {
        self.command(path).args(args.iter().cloned()).run()
    }

    /// Runs a container's configured entrypoint+cmd. Image config parsing
    /// (resolving these from the OCI manifest) happens outside this crate;
    /// callers pass the already-resolved argv halves.
    pub fn entrypoint_command(
        &self,
        entrypoint: &[String],
        cmd: &[String],
        env: &[(String, String)],
        cwd: &str,
    ) -> Result<CommandOutput> {
        let mut full: Vec<String> = entrypoint.iter().chain(cmd.iter()).cloned().collect();
        if full.is_empty() {
            return Err(Error::Protocol("entrypoint_command requires a program to run".to_string()));
        }
        let path = full.remove(0);
        self.run_command(&path, &full, env, cwd)
    }

    fn run_command(&self, path: &str, argv: &[String], env: &[(String, String)], cwd: &str) -> Result<CommandOutput> {
        let frame = Frame::Exec {
            path: path.to_string(),
            argv: argv.to_vec(),
            env: env.to_vec(),
            cwd: cwd.to_string(),
        };
        let channel = VsockChannel::connect(self.vsock.clone(), guestchan::COMMAND_PORT, COMMAND_TIMEOUT)?;
        channel.send(&frame.encode()?);
        let raw = channel.recv_until_closed(COMMAND_TIMEOUT)?;
        match decode_frame(&raw)? {
            Frame::ExecResult { exit_code, stdout, stderr } => Ok(CommandOutput { exit_code, stdout, stderr }),
            other => Err(Error::Protocol(format!("unexpected command frame: {other:?}"))),
        }
    }

    pub fn listen(&self, _port: u32) -> Result<()> {
        Err(Error::NotImplemented("Listen"))
    }

    pub fn dial(&self, _port: u32) -> Result<()> {
        Err(Error::NotImplemented("Dial"))
    }

    pub fn expose(&self, _host_port: u16, _guest_port: u16) -> Result<()> {
        Err(Error::NotImplemented("Expose"))
    }

    pub fn forward(&self, _host_port: u16, _guest_port: u16) -> Result<()> {
        Err(Error::NotImplemented("Forward"))
    }

    /// Captures the live overlay and persists it as a layer, delegating to
    /// C5/C8's capture + manifest machinery.
    pub fn snapshot_filesystem(
        &self,
        excludes: &layerfs::Excludes,
        cache_dir: &Path,
        cache_key: &str,
        base_image_ref: &str,
        architecture: &str,
        parent_layers: &[String],
    ) -> Result<layerfs::Manifest> {
        let walk = self.filesystem().capture();
        Ok(layerfs::snapshot_filesystem(
            walk,
            excludes,
            cache_dir,
            cache_key,
            base_image_ref,
            architecture,
            parent_layers,
        )?)
    }

    /// Blocks until the guest shuts itself down on its own (`PSCI
    /// SYSTEM_OFF`), without requesting shutdown first.
    pub fn wait(&mut self) -> Result<()> {
        if let Some(vm) = self.vm.take() {
            vm.wait()?;
        }
        Ok(())
    }

    /// Requests shutdown and blocks until the vCPU thread has exited. Safe
    /// to call more than once.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Some(vm) = self.vm.take() {
                vm.shutdown();
            }
        }
    }

    /// Unique for the process lifetime; not stable across restarts.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn done(&self) -> bool {
        self.closed
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode_frame(raw: &[u8]) -> Result<Frame> {
    if raw.len() < 4 {
        return Err(Error::Protocol("guest closed the connection before sending a frame".to_string()));
    }
    let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let body = raw
        .get(4..4 + len)
        .ok_or_else(|| Error::Protocol("truncated frame".to_string()))?;
    Ok(Frame::decode(body)?)
}

fn split_components(path: &str) -> VecDeque<String> {
    path.split('/').filter(|c| !c.is_empty()).map(String::from).collect()
}

fn split_parent(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((dir, name)) => (dir.to_string(), name.to_string()),
        None => (String::new(), trimmed.to_string()),
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
