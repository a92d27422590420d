//! Guest-physical address layout.
//!
//! RAM starts at 2GiB so the low gigabyte stays free for any future
//! firmware/ROM use; the emulated GICv3 distributor and redistributors sit
//! just below the mapped-IO ceiling, out of the way of RAM growth.

/// Start of guest RAM in guest-physical address space.
pub const DRAM_MEM_START: u64 = 0x8000_0000;

/// Upper bound of the low mapped-IO window (GIC, virtio MMIO transports).
/// Kept well below the 40-bit IPA boundary so it fits even on hosts with a
/// conservative default IPA size.
pub const MAPPED_IO_START: u64 = 1 << 39;

/// Entry point the boot protocol starts the single vCPU at.
pub const KERNEL_ENTRY_ADDR: u64 = DRAM_MEM_START;
