//! Minimal AF_VSOCK listener used for the boot-complete handshake and the
//! command channel the host drives via `Instance::Command`/`CommandContext`.
//!
//! Framing: 4-byte little-endian length prefix followed by a bincode-encoded
//! `Frame`. No retries, no multiplexing — one connection, one request at a
//! time, matching the host side's simple `BuildContext` driver.

use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

pub use guestchan::{Frame, BOOT_PORT, COMMAND_PORT};

const AF_VSOCK: libc::sa_family_t = 40;
const VMADDR_CID_ANY: u32 = 0xffff_ffff;

#[repr(C)]
#[derive(Clone, Copy)]
struct SockaddrVm {
    svm_family: libc::sa_family_t,
    svm_reserved1: u16,
    svm_port: u32,
    svm_cid: u32,
    svm_zero: [u8; 4],
}

pub struct VsockListener {
    fd: OwnedFd,
}

impl VsockListener {
    pub fn bind(port: u32) -> anyhow::Result<Self> {
        unsafe {
            let raw = libc::socket(AF_VSOCK as i32, libc::SOCK_STREAM, 0);
            if raw < 0 {
                anyhow::bail!("socket(AF_VSOCK) failed: {}", std::io::Error::last_os_error());
            }
            let fd = OwnedFd::from_raw_fd(raw);

            let addr = SockaddrVm {
                svm_family: AF_VSOCK,
                svm_reserved1: 0,
                svm_port: port,
                svm_cid: VMADDR_CID_ANY,
                svm_zero: [0; 4],
            };
            let rc = libc::bind(
                raw,
                &addr as *const SockaddrVm as *const libc::sockaddr,
                mem::size_of::<SockaddrVm>() as u32,
            );
            if rc != 0 {
                anyhow::bail!("bind(vsock:{port}) failed: {}", std::io::Error::last_os_error());
            }
            if libc::listen(raw, 1) != 0 {
                anyhow::bail!("listen(vsock:{port}) failed: {}", std::io::Error::last_os_error());
            }

            Ok(Self { fd })
        }
    }

    pub fn accept(&self) -> anyhow::Result<VsockStream> {
        unsafe {
            let raw = libc::accept(self.fd.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut());
            if raw < 0 {
                anyhow::bail!("accept() failed: {}", std::io::Error::last_os_error());
            }
            Ok(VsockStream { fd: OwnedFd::from_raw_fd(raw) })
        }
    }
}

pub struct VsockStream {
    fd: OwnedFd,
}

impl VsockStream {
    pub fn recv_frame(&mut self) -> anyhow::Result<Frame> {
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        self.read_exact(&mut body)?;
        Ok(Frame::decode(&body)?)
    }

    pub fn send_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.write_all(&frame.encode()?)?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        let mut off = 0;
        while off < buf.len() {
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf[off..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - off,
                )
            };
            if n < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if n == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "vsock closed"));
            }
            off += n as usize;
        }
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        let mut off = 0;
        while off < buf.len() {
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    buf[off..].as_ptr() as *const libc::c_void,
                    buf.len() - off,
                )
            };
            if n < 0 {
                return Err(std::io::Error::last_os_error());
            }
            off += n as usize;
        }
        Ok(())
    }
}
