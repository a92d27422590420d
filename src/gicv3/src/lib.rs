pub mod device;
pub mod mmio;
pub mod mmio_util;

pub use device::{GicV3, InterruptId, PeId};
pub use mmio_util::mmio_range;
