use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use devices::virtio::fs::{AbstractNode, Fs, NfsInfo};
use devices::virtio::FsError;

#[derive(Debug)]
pub enum FsConfigError {
    /// Failed to create the fs device.
    CreateFsDevice(FsError),
}

impl fmt::Display for FsConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::FsConfigError::*;
        match *self {
            CreateFsDevice(ref e) => write!(f, "Cannot create fs device: {e:?}"),
        }
    }
}

type Result<T> = std::result::Result<T, FsConfigError>;

#[derive(Clone)]
pub struct FsDeviceConfig {
    pub fs_id: String,
    pub shared_dir: String,
    pub nfs_info: Option<NfsInfo>,
    /// A prebuilt root, e.g. a layered container filesystem. When set,
    /// `shared_dir` is ignored and the device is built directly over it.
    pub root: Option<Arc<dyn AbstractNode>>,
}

impl fmt::Debug for FsDeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FsDeviceConfig")
            .field("fs_id", &self.fs_id)
            .field("shared_dir", &self.shared_dir)
            .field("nfs_info", &self.nfs_info)
            .field("root", &self.root.is_some())
            .finish()
    }
}

#[derive(Default)]
pub struct FsBuilder {
    pub list: VecDeque<Arc<Mutex<Fs>>>,
}

impl FsBuilder {
    pub fn new() -> Self {
        Self {
            list: VecDeque::<Arc<Mutex<Fs>>>::new(),
        }
    }

    pub fn insert(&mut self, config: FsDeviceConfig) -> Result<()> {
        let fs_dev = Arc::new(Mutex::new(Self::create_fs(config)?));
        self.list.push_back(fs_dev);
        Ok(())
    }

    pub fn create_fs(config: FsDeviceConfig) -> Result<Fs> {
        match config.root {
            Some(root) => Fs::new_with_root(config.fs_id, root, config.nfs_info),
            None => Fs::new(config.fs_id, config.shared_dir, config.nfs_info),
        }
        .map_err(FsConfigError::CreateFsDevice)
    }
}
