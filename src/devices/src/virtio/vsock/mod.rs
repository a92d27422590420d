//! A cut-down virtio-vsock transport carrying the host's exec/file-write
//! command channel to the guest init process: host-initiated stream
//! connections only, no credit-based flow control.

mod device;
mod host;
mod protocol;
mod worker;

pub use device::{VsockDevice, TYPE_VSOCK};
pub use host::{VsockChannel, VsockError, VsockShared};
pub use protocol::{GUEST_CID, HOST_CID};
