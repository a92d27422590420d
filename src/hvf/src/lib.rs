mod hypercalls;
mod memory;

pub use hypercalls::*;
pub use memory::{allocate_guest_memory, free_range, reuse_range};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::*;
