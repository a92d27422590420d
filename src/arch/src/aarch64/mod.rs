pub mod layout;
pub mod memory;

pub use memory::{ArchMemoryInfo, DAX_SIZE};
