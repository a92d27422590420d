//! Dispatches raw FUSE requests read off a virtqueue descriptor chain to a
//! [`Filesystem`] implementation, and marshals the response back.

use std::ffi::CStr;
use std::io::{Read, Write};

use vm_memory::ByteValued;

use crate::virtio::descriptor_utils::{Reader, Writer};

use super::filesystem::{Context, Filesystem, SecContext, SetattrValid as FsSetattrValid};
use super::fuse::*;
use super::FsError;

pub const MAX_BUFFER_SIZE: u32 = 1 << 20;
pub const MAX_PAGES: u32 = 256;

type Result<T> = std::result::Result<T, FsError>;

pub struct Server<F: Filesystem> {
    fs: F,
}

impl<F: Filesystem> Server<F> {
    pub fn new(fs: F) -> Self {
        Server { fs }
    }

    /// The backend this server dispatches FUSE requests into. Lets a host
    /// caller invoke filesystem operations directly instead of round-tripping
    /// through the virtqueue.
    pub fn filesystem(&self) -> &F {
        &self.fs
    }

    pub fn handle_message(&self, mut reader: Reader, mut writer: Writer) -> Result<usize> {
        let in_header: InHeader = reader.read_obj().map_err(FsError::DecodeMessage)?;
        let unique = in_header.unique;
        let ctx = Context {
            uid: in_header.uid,
            gid: in_header.gid,
            pid: in_header.pid,
        };

        let opcode = Opcode::from_raw(in_header.opcode);
        let outcome = match opcode {
            Some(Opcode::Init) => self.init(&mut reader),
            Some(Opcode::Destroy) => {
                self.fs.destroy();
                Ok(Reply::Empty)
            }
            Some(Opcode::Lookup) => self.lookup(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Forget) => {
                self.forget(&mut reader, ctx, in_header.nodeid)?;
                return self.reply_noreply(unique, &mut writer);
            }
            Some(Opcode::BatchForget) => {
                self.batch_forget(&mut reader, ctx)?;
                return self.reply_noreply(unique, &mut writer);
            }
            Some(Opcode::Getattr) => self.getattr(ctx, in_header.nodeid),
            Some(Opcode::Setattr) => self.setattr(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Readlink) => self.readlink(ctx, in_header.nodeid),
            Some(Opcode::Symlink) => self.symlink(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Mknod) => self.mknod(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Mkdir) => self.mkdir(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Unlink) => self.unlink(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Rmdir) => self.rmdir(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Rename) => self.rename(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Open) => self.open(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Create) => self.create(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Read) => return self.read(&mut reader, &mut writer, ctx, in_header.nodeid, unique),
            Some(Opcode::Write) => self.write(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Release) => {
                self.release(&mut reader, ctx, in_header.nodeid)?;
                Ok(Reply::Empty)
            }
            Some(Opcode::Opendir) => self.opendir(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Readdir) => {
                return self.readdir(&mut reader, &mut writer, ctx, in_header.nodeid, unique)
            }
            Some(Opcode::Releasedir) => {
                self.release(&mut reader, ctx, in_header.nodeid)?;
                Ok(Reply::Empty)
            }
            Some(Opcode::Fsync) | Some(Opcode::Fsyncdir) => self.fsync(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Getxattr) => self.getxattr(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Setxattr) => self.setxattr(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Listxattr) => self.listxattr(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Removexattr) => self.removexattr(&mut reader, ctx, in_header.nodeid),
            Some(Opcode::Statfs) => self.statfs(ctx, in_header.nodeid),
            None => Err(libc::ENOSYS),
        };

        match outcome {
            Ok(reply) => self.reply_ok(unique, reply, &mut writer),
            Err(errno) => self.reply_error(unique, errno, &mut writer),
        }
    }

    fn reply_ok(&self, unique: u64, reply: Reply, writer: &mut Writer) -> Result<usize> {
        let body = reply.encode();
        let out_header = OutHeader {
            len: (std::mem::size_of::<OutHeader>() + body.len()) as u32,
            error: 0,
            unique,
        };
        writer.write_obj(out_header).map_err(FsError::EncodeMessage)?;
        if !body.is_empty() {
            writer
                .write_all(&body)
                .map_err(FsError::EncodeMessage)?;
        }
        Ok(out_header.len as usize)
    }

    fn reply_error(&self, unique: u64, errno: i32, writer: &mut Writer) -> Result<usize> {
        let out_header = OutHeader {
            len: std::mem::size_of::<OutHeader>() as u32,
            error: -errno,
            unique,
        };
        writer.write_obj(out_header).map_err(FsError::EncodeMessage)?;
        Ok(out_header.len as usize)
    }

    fn reply_noreply(&self, _unique: u64, _writer: &mut Writer) -> Result<usize> {
        // FORGET/BATCH_FORGET carry no reply.
        Ok(0)
    }

    fn init(&self, reader: &mut Reader) -> std::result::Result<Reply, i32> {
        let _in: InitIn = reader.read_obj().map_err(|_| libc::EIO)?;
        self.fs.init().map_err(|_| libc::EIO)?;
        Ok(Reply::Init(InitOut {
            major: FUSE_KERNEL_VERSION,
            minor: FUSE_KERNEL_MINOR_VERSION,
            max_readahead: 1 << 20,
            flags: FUSE_DO_READDIRPLUS,
            max_background: 16,
            congestion_threshold: 12,
            max_write: MAX_BUFFER_SIZE,
            time_gran: 1,
            max_pages: MAX_PAGES as u16,
            map_alignment: 0,
            unused: [0; 7],
        }))
    }

    fn lookup(&self, reader: &mut Reader, ctx: Context, parent: u64) -> std::result::Result<Reply, i32> {
        let name = read_name(reader)?;
        let entry = self.fs.lookup(ctx, parent, &name).map_err(norm)?;
        Ok(Reply::Entry(entry_out(&entry)))
    }

    fn forget(&self, reader: &mut Reader, ctx: Context, nodeid: u64) -> std::result::Result<(), i32> {
        let inner: ForgetIn = reader.read_obj().map_err(|_| libc::EIO)?;
        self.fs.forget(ctx, nodeid, inner.nlookup);
        Ok(())
    }

    fn batch_forget(&self, reader: &mut Reader, ctx: Context) -> std::result::Result<(), i32> {
        let hdr: BatchForgetIn = reader.read_obj().map_err(|_| libc::EIO)?;
        for _ in 0..hdr.count {
            let one: ForgetOne = reader.read_obj().map_err(|_| libc::EIO)?;
            self.fs.forget(ctx, one.nodeid, one.nlookup);
        }
        Ok(())
    }

    fn getattr(&self, ctx: Context, nodeid: u64) -> std::result::Result<Reply, i32> {
        let (attr, timeout) = self.fs.getattr(ctx, nodeid, None).map_err(norm)?;
        Ok(Reply::Attr(AttrOut {
            attr_valid: timeout.as_secs(),
            attr_valid_nsec: timeout.subsec_nanos(),
            dummy: 0,
            attr,
        }))
    }

    fn setattr(&self, reader: &mut Reader, ctx: Context, nodeid: u64) -> std::result::Result<Reply, i32> {
        let inner: SetattrIn = reader.read_obj().map_err(|_| libc::EIO)?;
        let flags = SetattrValid::from_bits_truncate(inner.valid);
        let valid = FsSetattrValid {
            mode: flags.contains(SetattrValid::MODE).then_some(inner.mode),
            uid: flags.contains(SetattrValid::UID).then_some(inner.uid),
            gid: flags.contains(SetattrValid::GID).then_some(inner.gid),
            size: flags.contains(SetattrValid::SIZE).then_some(inner.size),
            atime: flags
                .contains(SetattrValid::ATIME)
                .then_some((inner.atime, inner.atimensec)),
            mtime: flags
                .contains(SetattrValid::MTIME)
                .then_some((inner.mtime, inner.mtimensec)),
        };
        let handle = (inner.fh != 0).then_some(inner.fh);
        let (attr, timeout) = self.fs.setattr(ctx, nodeid, valid, handle).map_err(norm)?;
        Ok(Reply::Attr(AttrOut {
            attr_valid: timeout.as_secs(),
            attr_valid_nsec: timeout.subsec_nanos(),
            dummy: 0,
            attr,
        }))
    }

    fn readlink(&self, ctx: Context, nodeid: u64) -> std::result::Result<Reply, i32> {
        let target = self.fs.readlink(ctx, nodeid).map_err(norm)?;
        Ok(Reply::Raw(target))
    }

    fn symlink(&self, reader: &mut Reader, ctx: Context, parent: u64) -> std::result::Result<Reply, i32> {
        let name = read_name(reader)?;
        let target = read_name(reader)?;
        let entry = self
            .fs
            .symlink(ctx, &target, parent, &name, SecContext::default())
            .map_err(norm)?;
        Ok(Reply::Entry(entry_out(&entry)))
    }

    fn mknod(&self, reader: &mut Reader, ctx: Context, parent: u64) -> std::result::Result<Reply, i32> {
        let inner: MknodIn = reader.read_obj().map_err(|_| libc::EIO)?;
        let name = read_name(reader)?;
        let entry = self
            .fs
            .mknod(
                ctx,
                parent,
                &name,
                inner.mode,
                inner.rdev,
                inner.umask,
                SecContext::default(),
            )
            .map_err(norm)?;
        Ok(Reply::Entry(entry_out(&entry)))
    }

    fn mkdir(&self, reader: &mut Reader, ctx: Context, parent: u64) -> std::result::Result<Reply, i32> {
        let inner: MkdirIn = reader.read_obj().map_err(|_| libc::EIO)?;
        let name = read_name(reader)?;
        let entry = self
            .fs
            .mkdir(ctx, parent, &name, inner.mode, inner.umask, SecContext::default())
            .map_err(norm)?;
        Ok(Reply::Entry(entry_out(&entry)))
    }

    fn unlink(&self, reader: &mut Reader, ctx: Context, parent: u64) -> std::result::Result<Reply, i32> {
        let name = read_name(reader)?;
        self.fs.unlink(ctx, parent, &name).map_err(norm)?;
        Ok(Reply::Empty)
    }

    fn rmdir(&self, reader: &mut Reader, ctx: Context, parent: u64) -> std::result::Result<Reply, i32> {
        let name = read_name(reader)?;
        self.fs.rmdir(ctx, parent, &name).map_err(norm)?;
        Ok(Reply::Empty)
    }

    fn rename(&self, reader: &mut Reader, ctx: Context, olddir: u64) -> std::result::Result<Reply, i32> {
        let inner: RenameIn = reader.read_obj().map_err(|_| libc::EIO)?;
        let oldname = read_name(reader)?;
        let newname = read_name(reader)?;
        self.fs
            .rename(ctx, olddir, &oldname, inner.newdir, &newname)
            .map_err(norm)?;
        Ok(Reply::Empty)
    }

    fn open(&self, reader: &mut Reader, ctx: Context, nodeid: u64) -> std::result::Result<Reply, i32> {
        let inner: OpenIn = reader.read_obj().map_err(|_| libc::EIO)?;
        let (handle, open_flags) = self.fs.open(ctx, nodeid, inner.flags).map_err(norm)?;
        Ok(Reply::Open(OpenOut {
            fh: handle.unwrap_or(0),
            open_flags,
            padding: 0,
        }))
    }

    fn create(&self, reader: &mut Reader, ctx: Context, parent: u64) -> std::result::Result<Reply, i32> {
        let inner: CreateIn = reader.read_obj().map_err(|_| libc::EIO)?;
        let name = read_name(reader)?;
        let (entry, handle, open_flags) = self
            .fs
            .create(
                ctx,
                parent,
                &name,
                inner.mode,
                inner.flags,
                inner.umask,
                SecContext::default(),
            )
            .map_err(norm)?;
        Ok(Reply::Create(
            entry_out(&entry),
            OpenOut {
                fh: handle.unwrap_or(0),
                open_flags,
                padding: 0,
            },
        ))
    }

    fn read(
        &self,
        reader: &mut Reader,
        writer: &mut Writer,
        ctx: Context,
        nodeid: u64,
        unique: u64,
    ) -> Result<usize> {
        let inner: ReadIn = reader.read_obj().map_err(FsError::DecodeMessage)?;
        match self
            .fs
            .read(ctx, nodeid, inner.fh, inner.offset, inner.size)
        {
            Ok(data) => {
                let out_header = OutHeader {
                    len: (std::mem::size_of::<OutHeader>() + data.len()) as u32,
                    error: 0,
                    unique,
                };
                writer.write_obj(out_header).map_err(FsError::EncodeMessage)?;
                writer.write_all(&data).map_err(FsError::EncodeMessage)?;
                Ok(out_header.len as usize)
            }
            Err(errno) => self.reply_error(unique, errno, writer),
        }
    }

    fn write(&self, reader: &mut Reader, ctx: Context, nodeid: u64) -> std::result::Result<Reply, i32> {
        let inner: WriteIn = reader.read_obj().map_err(|_| libc::EIO)?;
        let mut data = vec![0u8; inner.size as usize];
        reader.read_exact(&mut data).map_err(|_| libc::EIO)?;
        let written = self
            .fs
            .write(ctx, nodeid, inner.fh, inner.offset, &data)
            .map_err(norm)?;
        Ok(Reply::Write(WriteOut {
            size: written,
            padding: 0,
        }))
    }

    fn release(&self, reader: &mut Reader, ctx: Context, nodeid: u64) -> std::result::Result<(), i32> {
        let inner: ReleaseIn = reader.read_obj().map_err(|_| libc::EIO)?;
        self.fs.release(ctx, nodeid, inner.fh);
        Ok(())
    }

    fn opendir(&self, reader: &mut Reader, ctx: Context, nodeid: u64) -> std::result::Result<Reply, i32> {
        let inner: OpenIn = reader.read_obj().map_err(|_| libc::EIO)?;
        let handle = self.fs.opendir(ctx, nodeid, inner.flags).map_err(norm)?;
        Ok(Reply::Open(OpenOut {
            fh: handle.unwrap_or(0),
            open_flags: 0,
            padding: 0,
        }))
    }

    fn readdir(
        &self,
        reader: &mut Reader,
        writer: &mut Writer,
        ctx: Context,
        nodeid: u64,
        unique: u64,
    ) -> Result<usize> {
        let inner: ReadIn = reader.read_obj().map_err(FsError::DecodeMessage)?;
        match self.fs.readdir(ctx, nodeid, inner.fh, inner.offset) {
            Ok(entries) => {
                let mut body = Vec::new();
                for entry in entries {
                    let mut name = entry.name.clone();
                    name.push(0);
                    let pad = (8 - (name.len() % 8)) % 8;
                    let header = DirentHeader {
                        ino: entry.ino,
                        off: entry.offset,
                        namelen: entry.name.len() as u32,
                        dtype: entry.kind,
                    };
                    body.extend_from_slice(header.as_slice());
                    body.extend_from_slice(&name);
                    body.extend(std::iter::repeat(0u8).take(pad));
                    if body.len() as u32 > inner.size {
                        break;
                    }
                }
                let out_header = OutHeader {
                    len: (std::mem::size_of::<OutHeader>() + body.len()) as u32,
                    error: 0,
                    unique,
                };
                writer.write_obj(out_header).map_err(FsError::EncodeMessage)?;
                writer.write_all(&body).map_err(FsError::EncodeMessage)?;
                Ok(out_header.len as usize)
            }
            Err(errno) => self.reply_error(unique, errno, writer),
        }
    }

    fn fsync(&self, reader: &mut Reader, ctx: Context, nodeid: u64) -> std::result::Result<Reply, i32> {
        let inner: FsyncIn = reader.read_obj().map_err(|_| libc::EIO)?;
        self.fs
            .fsync(ctx, nodeid, inner.fh, inner.fsync_flags & 1 != 0)
            .map_err(norm)?;
        Ok(Reply::Empty)
    }

    fn getxattr(&self, reader: &mut Reader, ctx: Context, nodeid: u64) -> std::result::Result<Reply, i32> {
        let inner: GetxattrIn = reader.read_obj().map_err(|_| libc::EIO)?;
        let name = read_name(reader)?;
        let value = self.fs.getxattr(ctx, nodeid, &name, inner.size).map_err(norm)?;
        if inner.size == 0 {
            Ok(Reply::Xattr(GetxattrOut {
                size: value.len() as u32,
                padding: 0,
            }))
        } else {
            Ok(Reply::Raw(value))
        }
    }

    fn setxattr(&self, reader: &mut Reader, ctx: Context, nodeid: u64) -> std::result::Result<Reply, i32> {
        let inner: SetxattrIn = reader.read_obj().map_err(|_| libc::EIO)?;
        let name = read_name(reader)?;
        let mut value = vec![0u8; inner.size as usize];
        reader.read_exact(&mut value).map_err(|_| libc::EIO)?;
        self.fs
            .setxattr(ctx, nodeid, &name, &value, inner.flags)
            .map_err(norm)?;
        Ok(Reply::Empty)
    }

    fn listxattr(&self, reader: &mut Reader, ctx: Context, nodeid: u64) -> std::result::Result<Reply, i32> {
        let inner: GetxattrIn = reader.read_obj().map_err(|_| libc::EIO)?;
        let list = self.fs.listxattr(ctx, nodeid, inner.size).map_err(norm)?;
        if inner.size == 0 {
            Ok(Reply::Xattr(GetxattrOut {
                size: list.len() as u32,
                padding: 0,
            }))
        } else {
            Ok(Reply::Raw(list))
        }
    }

    fn removexattr(&self, reader: &mut Reader, ctx: Context, nodeid: u64) -> std::result::Result<Reply, i32> {
        let name = read_name(reader)?;
        self.fs.removexattr(ctx, nodeid, &name).map_err(norm)?;
        Ok(Reply::Empty)
    }

    fn statfs(&self, ctx: Context, nodeid: u64) -> std::result::Result<Reply, i32> {
        let st = self.fs.statfs(ctx, nodeid).map_err(norm)?;
        Ok(Reply::Statfs(StatfsOut {
            blocks: st.blocks,
            bfree: st.bfree,
            bavail: st.bavail,
            files: st.files,
            ffree: st.ffree,
            bsize: st.bsize,
            namelen: st.namelen,
            frsize: st.frsize,
            padding: 0,
            spare: [0; 6],
        }))
    }
}

fn norm(errno: i32) -> i32 {
    errno
}

fn read_name(reader: &mut Reader) -> std::result::Result<Vec<u8>, i32> {
    let remaining = reader.available_bytes();
    let mut buf = vec![0u8; remaining];
    reader.read_exact(&mut buf).map_err(|_| libc::EIO)?;
    let cstr = CStr::from_bytes_until_nul(&buf).map_err(|_| libc::EINVAL)?;
    Ok(cstr.to_bytes().to_vec())
}

fn entry_out(entry: &super::filesystem::Entry) -> EntryOut {
    EntryOut {
        nodeid: entry.nodeid,
        generation: entry.generation,
        entry_valid: entry.entry_timeout.as_secs(),
        attr_valid: entry.attr_timeout.as_secs(),
        entry_valid_nsec: entry.entry_timeout.subsec_nanos(),
        attr_valid_nsec: entry.attr_timeout.subsec_nanos(),
        attr: entry.attr,
    }
}

enum Reply {
    Empty,
    Entry(EntryOut),
    Attr(AttrOut),
    Open(OpenOut),
    Create(EntryOut, OpenOut),
    Write(WriteOut),
    Xattr(GetxattrOut),
    Statfs(StatfsOut),
    Init(InitOut),
    Raw(Vec<u8>),
}

impl Reply {
    fn encode(&self) -> Vec<u8> {
        match self {
            Reply::Empty => Vec::new(),
            Reply::Entry(e) => e.as_slice().to_vec(),
            Reply::Attr(a) => a.as_slice().to_vec(),
            Reply::Open(o) => o.as_slice().to_vec(),
            Reply::Create(e, o) => {
                let mut v = e.as_slice().to_vec();
                v.extend_from_slice(o.as_slice());
                v
            }
            Reply::Write(w) => w.as_slice().to_vec(),
            Reply::Xattr(x) => x.as_slice().to_vec(),
            Reply::Statfs(s) => s.as_slice().to_vec(),
            Reply::Init(i) => i.as_slice().to_vec(),
            Reply::Raw(bytes) => bytes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrips_known_values() {
        assert_eq!(Opcode::from_raw(15), Some(Opcode::Read));
        assert_eq!(Opcode::from_raw(16), Some(Opcode::Write));
        assert_eq!(Opcode::from_raw(9999), None);
    }
}
