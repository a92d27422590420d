use std::ffi::c_void;

use arch::aarch64::layout;
use arch::aarch64::memory::DAX_SIZE;
use arch::ArchMemoryInfo;
use bitflags::bitflags;
use tracing::{debug, error};
use vm_memory::{Address, GuestAddress};

use crate::aarch64::bindings::{hv_vm_create, hv_vm_destroy, hv_vm_map, hv_vm_protect, hv_vm_unmap};
use crate::aarch64::vm_config::VmConfig;
use crate::aarch64::weak_link::{OPTIONAL12, OPTIONAL15};
use crate::call_optional;

use super::bindings::{hv_memory_flags_t, hv_vcpu_t, hv_vcpus_exit, HV_MEMORY_EXEC, HV_MEMORY_READ, HV_MEMORY_WRITE};
use super::{Error, HvfError};

bitflags! {
    pub struct MemoryFlags: hv_memory_flags_t {
        const READ = HV_MEMORY_READ;
        const WRITE = HV_MEMORY_WRITE;
        const EXEC = HV_MEMORY_EXEC;

        const NONE = 0;
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

/// GIC distributor/redistributor base addresses and sizes, queried from the
/// host's hardware GIC at VM creation time and handed to the gicv3 crate so
/// its MMIO surface lines up with where the real interrupt routing lives.
#[derive(Debug, Clone, Copy)]
pub struct GicLayout {
    pub dist_base: u64,
    pub dist_size: u64,
    pub redist_base: u64,
    pub redist_total_size: u64,
}

pub struct HvfVm {
    gic: Option<GicLayout>,
}

impl HvfVm {
    /// Creates the VM and maps `memory_base..memory_base+mem_info.size()` with
    /// read/write/execute permissions. The IPA size is sized to the highest
    /// guest-physical address actually needed.
    pub fn new(mem_info: &ArchMemoryInfo) -> Result<Self, Error> {
        let config = VmConfig::new();

        if let Some(config) = &config {
            let ipa_bits = (mem_info.last_addr_excl().raw_value() - 1).ilog2() + 1;
            debug!("IPA size: {} bits", ipa_bits);
            if ipa_bits > Self::get_default_ipa_size()? {
                if ipa_bits > Self::get_max_ipa_size()? {
                    return Err(Error::VmConfigIpaSizeLimit(ipa_bits));
                }
                config.set_ipa_size(ipa_bits)?;
            }
        }

        let gic = Self::configure_gic();

        let ret = unsafe { hv_vm_create(config.as_ref().map_or(std::ptr::null_mut(), VmConfig::as_ptr)) };
        HvfError::result(ret).map_err(|e| {
            if e.is_unavailable() {
                Error::Unavailable(e)
            } else {
                Error::VmCreate(e)
            }
        })?;

        Ok(Self { gic })
    }

    fn configure_gic() -> Option<GicLayout> {
        let hvf_optional = OPTIONAL15.as_ref()?;

        let dist_size = unsafe { Self::gic_distributor_size(hvf_optional) }.ok()?;
        let redist_total_size = unsafe { Self::gic_redistributor_size(hvf_optional) }.ok()?;

        let dist_base = layout::MAPPED_IO_START - dist_size;
        let redist_base = dist_base - redist_total_size;

        let config = unsafe { hvf_optional.hv_gic_config_create() };
        unsafe {
            HvfError::result(hvf_optional.hv_gic_config_set_distributor_base(config, dist_base))
                .ok()?;
            HvfError::result(hvf_optional.hv_gic_config_set_redistributor_base(config, redist_base))
                .ok()?;
            HvfError::result(hvf_optional.hv_gic_create(config)).ok()?;
        }

        Some(GicLayout {
            dist_base,
            dist_size,
            redist_base,
            redist_total_size,
        })
    }

    unsafe fn gic_distributor_size(
        hvf_optional: &crate::aarch64::weak_link::HvfOptional15,
    ) -> Result<u64, Error> {
        let mut size: usize = 0;
        HvfError::result(hvf_optional.hv_gic_get_distributor_size(&mut size))
            .map_err(Error::GicGetDistributorSize)?;
        Ok(size as u64)
    }

    unsafe fn gic_redistributor_size(
        hvf_optional: &crate::aarch64::weak_link::HvfOptional15,
    ) -> Result<u64, Error> {
        let mut size: usize = 0;
        HvfError::result(hvf_optional.hv_gic_get_redistributor_region_size(&mut size))
            .map_err(Error::GicGetRedistributorSize)?;
        Ok(size as u64)
    }

    pub fn gic_layout(&self) -> Option<GicLayout> {
        self.gic
    }

    /// Sets or clears a shared-peripheral-interrupt line on the host's real
    /// GIC. Falls back to per-vCPU pending-interrupt injection on hosts
    /// without the native GIC config API (see `HvfVcpu::set_pending_irq`).
    pub fn signal_spi(&self, intid: u32, level: bool) -> Result<(), Error> {
        let ret = unsafe { call_optional!(OPTIONAL15.hv_gic_set_spi(intid, level)) };
        HvfError::result(ret).map_err(Error::GicAssertSpi)
    }

    /// # Safety
    /// `host_start_addr` must point at a mapped, contiguous host allocation
    /// of at least `size` bytes that outlives the mapping.
    pub unsafe fn map_memory(
        &self,
        host_start_addr: *mut u8,
        guest_start_addr: GuestAddress,
        size: usize,
        flags: MemoryFlags,
    ) -> Result<(), Error> {
        let ret = hv_vm_map(
            host_start_addr as *mut c_void,
            guest_start_addr.raw_value(),
            size,
            flags.bits(),
        );
        HvfError::result(ret).map_err(Error::MemoryMap)
    }

    pub fn unmap_memory(&self, guest_start_addr: GuestAddress, size: usize) -> Result<(), Error> {
        let ret = unsafe { hv_vm_unmap(guest_start_addr.raw_value(), size) };
        HvfError::result(ret).map_err(Error::MemoryUnmap)
    }

    pub fn protect_memory(
        &self,
        guest_start_addr: GuestAddress,
        size: usize,
        flags: MemoryFlags,
    ) -> Result<(), Error> {
        let ret = unsafe { hv_vm_protect(guest_start_addr.raw_value(), size, flags.bits()) };
        HvfError::result(ret).map_err(Error::MemoryProtect)
    }

    /// Forces every listed vCPU's `run()` call to return `VcpuExit::Canceled`.
    pub fn force_exits(&self, vcpu_ids: &[hv_vcpu_t]) -> Result<(), Error> {
        let ret = unsafe { hv_vcpus_exit(vcpu_ids.as_ptr() as *mut _, vcpu_ids.len() as u32) };
        HvfError::result(ret).map_err(Error::VcpuRequestExit)
    }

    pub fn destroy(&self) {
        let ret = unsafe { hv_vm_destroy() };
        if let Err(e) = HvfError::result(ret) {
            error!("failed to destroy VM: {e}");
        }
    }

    /// Re-applies protection flags on the single process-wide VM without
    /// going through an `HvfVm` instance. Hypervisor.framework only ever
    /// allows one VM per process, so this is safe to call from contexts
    /// (like the balloon device's free-page reporting) that don't hold one.
    pub fn protect_memory_raw(
        guest_addr: GuestAddress,
        size: usize,
        flags: MemoryFlags,
    ) -> Result<(), Error> {
        let ret = unsafe { hv_vm_protect(guest_addr.raw_value(), size, flags.bits()) };
        HvfError::result(ret).map_err(Error::MemoryProtect)
    }

    fn get_default_ipa_size() -> Result<u32, Error> {
        let mut ipa_bit_length: u32 = 0;
        let ret = unsafe { call_optional!(OPTIONAL12.hv_vm_config_get_default_ipa_size(&mut ipa_bit_length)) };
        HvfError::result(ret).map_err(Error::VmConfigGetDefaultIpaSize)?;
        Ok(ipa_bit_length)
    }

    fn get_max_ipa_size() -> Result<u32, Error> {
        let mut ipa_bit_length: u32 = 0;
        let ret = unsafe { call_optional!(OPTIONAL12.hv_vm_config_get_max_ipa_size(&mut ipa_bit_length)) };
        HvfError::result(ret).map_err(Error::VmConfigGetMaxIpaSize)?;
        Ok(ipa_bit_length)
    }

    pub fn max_ram_size() -> Result<u64, Error> {
        let max_addr = (1u64 << Self::get_max_ipa_size()?) - 1;
        let max_ram_addr = max_addr - DAX_SIZE - 0x4000_0000;
        Ok(max_ram_addr - layout::DRAM_MEM_START)
    }
}

impl Drop for HvfVm {
    fn drop(&mut self) {
        self.destroy();
    }
}
