use vm_memory::{Address, GuestAddress};

use super::layout::DRAM_MEM_START;

/// Reserved above guest RAM for the DAX window libkrun-derived hosts map in
/// for virtiofs shared memory; kept out of the usable RAM size calculation.
pub const DAX_SIZE: u64 = 0;

/// Describes the single contiguous guest RAM region backing a VM.
#[derive(Debug, Clone, Copy)]
pub struct ArchMemoryInfo {
    base: GuestAddress,
    size: u64,
}

impl ArchMemoryInfo {
    pub fn new(size: u64) -> Self {
        Self {
            base: GuestAddress(DRAM_MEM_START),
            size,
        }
    }

    pub fn base(&self) -> GuestAddress {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// First guest-physical address past the end of RAM.
    pub fn last_addr_excl(&self) -> GuestAddress {
        GuestAddress(self.base.raw_value() + self.size)
    }
}
