mod cow;
mod device;
#[allow(dead_code)]
mod filesystem;
pub mod fuse;
mod server;
mod worker;

use super::descriptor_utils;
use serde::{Deserialize, Serialize};

pub use self::cow::{AbstractNode, CowFs, DirBacking, NodeKind, WalkEntry};
pub use self::defs::uapi::VIRTIO_ID_FS as TYPE_FS;
pub use self::device::Fs;
pub use self::filesystem::{Context, DirEntry, Entry, Filesystem, Handle, NodeId, SecContext, SetattrValid};
pub use self::fuse::{Attr, FUSE_ROOT_ID};
pub use self::server::Server;

mod defs {
    pub const FS_DEV_ID: &str = "virtio_fs";
    pub const NUM_QUEUES: usize = 2;
    pub const QUEUE_SIZES: &[u16] = &[1024; NUM_QUEUES];
    // High priority queue.
    pub const HPQ_INDEX: usize = 0;
    // Request queue.
    pub const REQ_INDEX: usize = 1;

    pub mod uapi {
        pub const VIRTIO_ID_FS: u32 = 26;
    }
}

use std::ffi::{FromBytesWithNulError, FromVecWithNulError};
use std::io;

use descriptor_utils::Error as DescriptorError;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("failed to decode protocol message: {0}")]
    DecodeMessage(io::Error),
    #[error("failed to encode protocol message: {0}")]
    EncodeMessage(io::Error),
    #[error("failed to create event fd: {0}")]
    EventFd(std::io::Error),
    #[error("failed to create fs server: {0}")]
    CreateServer(std::io::Error),
    #[error("guest did not negotiate a required extension")]
    MissingExtension,
    #[error("one or more parameters are missing")]
    MissingParameter,
    #[error("invalid C string parameter: {0}")]
    InvalidCString(FromBytesWithNulError),
    #[error("invalid C string parameter: {0}")]
    InvalidCString2(FromVecWithNulError),
    #[error("the `len` field of the header is too small")]
    InvalidHeaderLength,
    #[error("SetxattrIn size {0:?} does not match the decoded value's length")]
    InvalidXattrSize((u32, usize)),
    #[error("failed to read request from queue: {0}")]
    QueueReader(DescriptorError),
    #[error("failed to write response to queue: {0}")]
    QueueWriter(DescriptorError),
}

#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NfsInfo {
    dir_dev: i32,
    dir_inode: u64,
    dir_name: String,
    parent_dir_dev: i32,
    parent_dir_inode: u64,
    empty_dir_inode: u64,
}

type Result<T> = std::result::Result<T, FsError>;
