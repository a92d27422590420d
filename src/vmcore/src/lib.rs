//! Boot/session coordinator: builds the virtio devices a container needs,
//! starts the VM, waits for the guest's init program to come up, and hands
//! back an [`instance::Instance`] for host callers to operate the container
//! through — file operations straight against the filesystem backend,
//! program execution over the guest's vsock command channel.

#[cfg(target_os = "macos")]
pub mod instance;

use std::env;
use std::sync::OnceLock;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("hypervisor: {0}")]
    Hvf(#[from] hvf::Error),
    #[error("vm session: {0}")]
    Vmm(#[from] vmm::Error),
    #[error("filesystem backend: {0}")]
    Fs(#[from] devices::virtio::FsError),
    #[error("filesystem operation failed (errno {0})")]
    Errno(i32),
    #[error("layered filesystem: {0}")]
    Layer(#[from] layerfs::Error),
    #[error("guest command channel: {0}")]
    Vsock(#[from] devices::virtio::VsockError),
    #[error("guest channel codec: {0}")]
    Codec(#[from] guestchan::CodecError),
    #[error("guest memory: {0}")]
    Memory(#[from] vm_memory::GuestMemoryError),
    #[error("guest command channel protocol violation: {0}")]
    Protocol(String),
    #[error("path has too many symlink hops")]
    SymlinkLoop,
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Debug knobs read once from the environment, mirroring the teacher's
/// pattern of gating all later reads on a single `OnceLock` fill
/// (`hvf::VM_ALLOCATION`).
#[derive(Debug, Clone, Default)]
pub struct DebugConfig {
    /// `CC_VERBOSE=1` raises the default tracing filter to `debug`.
    pub verbose: bool,
    /// `CC_DEBUG_FILE`: path tracing output is additionally written to.
    pub debug_file: Option<String>,
    /// `CC_TIMESLICE_FILE`: path vCPU run-loop timeslice stats are appended to.
    pub timeslice_file: Option<String>,
}

static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

impl DebugConfig {
    pub fn from_env() -> &'static DebugConfig {
        DEBUG_CONFIG.get_or_init(|| DebugConfig {
            verbose: env::var("CC_VERBOSE").map(|v| v != "0").unwrap_or(false),
            debug_file: env::var("CC_DEBUG_FILE").ok(),
            timeslice_file: env::var("CC_TIMESLICE_FILE").ok(),
        })
    }
}

/// Installs the `tracing` subscriber, honoring [`DebugConfig`]. Safe to call
/// more than once; only the first call takes effect.
pub fn init_logger_once() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let cfg = DebugConfig::from_env();
        let level = if cfg.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };
        let subscriber = tracing_subscriber::fmt().with_max_level(level).finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
