pub mod vstate;

use std::sync::Arc;

use arch::ArchMemoryInfo;
use devices::virtio::VirtioDevice;
use tracing::info;
use utils::Mutex;
use vm_memory::{GuestAddress, GuestMemoryMmap};
use vmm_ids::VmmShutdownSignal;

pub use vstate::{Vcpu, VcpuHandle, Vm};

use crate::mmio::{self, MmioTransport};

/// Where the first virtio-mmio device window starts. Kept well below
/// `DRAM_MEM_START` (0x8000_0000) and the GIC's own frames, which sit just
/// under the mapped-IO ceiling.
pub const VIRTIO_MMIO_BASE: u64 = 0x1000_0000;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Memory(#[from] anyhow::Error),
    #[error(transparent)]
    Vcpu(#[from] vstate::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One device's assigned slot on the virtio-mmio bus: where its register
/// window lives and which SPI it raises, for whoever builds the guest's
/// device tree / kernel command line.
#[derive(Debug, Clone, Copy)]
pub struct MmioSlot {
    pub mmio_base: u64,
    pub irq: u32,
}

/// A fully wired, not-yet-running VM: guest memory is mapped, the GIC and
/// every virtio-mmio device are on the bus, and the single vCPU is
/// configured but not started.
pub struct VmSession {
    vm: Vm,
    guest_mem: GuestMemoryMmap,
    vcpu: Option<Vcpu>,
    slots: Vec<MmioSlot>,
    shutdown: VmmShutdownSignal,
}

impl VmSession {
    /// Allocates `mem_size` bytes of guest RAM starting at
    /// `DRAM_MEM_START`, creates the VM and virtual GIC, and registers
    /// `devices` on the virtio-mmio bus in order, one window and one SPI
    /// each.
    pub fn new(
        mem_size: u64,
        devices: Vec<Box<dyn VirtioDevice>>,
        shutdown: VmmShutdownSignal,
    ) -> Result<Self> {
        let mem_info = ArchMemoryInfo::new(mem_size);
        let guest_mem = hvf::allocate_guest_memory(&[(mem_info.base(), mem_size as usize)])?;

        let mut vm = Vm::new(&mem_info, shutdown.clone())?;
        map_guest_memory(&vm, &guest_mem)?;

        vm.setup_irqchip(1)?;

        let mut slots = Vec::with_capacity(devices.len());
        for (i, mut device) in devices.into_iter().enumerate() {
            let irq = gicv3_spi_for_index(i);
            device.set_irq_line(irq);

            let mmio_base = VIRTIO_MMIO_BASE + (i as u64) * mmio::MMIO_WINDOW_SIZE;
            let mut transport = MmioTransport::new(device);
            transport.set_memory(guest_mem.clone());

            vm.register_mmio_device(
                Arc::new(Mutex::new(transport)),
                mmio_base,
                mmio::MMIO_WINDOW_SIZE,
            );
            slots.push(MmioSlot { mmio_base, irq });

            info!(mmio_base, irq, "registered virtio-mmio device");
        }

        let vcpu = Vcpu::new(
            0,
            guest_mem.clone(),
            vm.hvf_vm().clone(),
            vm.bus().clone(),
            vm.gic().cloned(),
        )?;

        Ok(VmSession {
            vm,
            guest_mem,
            vcpu: Some(vcpu),
            slots,
            shutdown,
        })
    }

    pub fn guest_mem(&self) -> &GuestMemoryMmap {
        &self.guest_mem
    }

    pub fn mmio_slots(&self) -> &[MmioSlot] {
        &self.slots
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// Starts the vCPU thread at `entry_addr`. Call after the kernel image
    /// and any boot-time data (device tree, command line) have been written
    /// into `VmSession::guest_mem`.
    pub fn boot(mut self, entry_addr: GuestAddress) -> Result<RunningVm> {
        let vcpu = self.vcpu.take().expect("boot() called twice");
        let handle = VcpuHandle::spawn(vcpu, entry_addr, self.shutdown.clone())?;

        Ok(RunningVm {
            vm: self.vm,
            guest_mem: self.guest_mem,
            vcpu_handle: handle,
            shutdown: self.shutdown,
        })
    }
}

/// A VM whose vCPU thread is running.
pub struct RunningVm {
    vm: Vm,
    guest_mem: GuestMemoryMmap,
    vcpu_handle: VcpuHandle,
    shutdown: VmmShutdownSignal,
}

impl RunningVm {
    pub fn guest_mem(&self) -> &GuestMemoryMmap {
        &self.guest_mem
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn shutdown_signal(&self) -> &VmmShutdownSignal {
        &self.shutdown
    }

    /// Requests shutdown and blocks until the vCPU thread has exited.
    pub fn shutdown(self) {
        self.shutdown.shutdown();
        if let Err(e) = self.vcpu_handle.join() {
            tracing::error!("vcpu thread returned an error during shutdown: {:?}", e);
        }
    }

    /// Blocks until the vCPU thread exits on its own (guest-initiated
    /// `PSCI SYSTEM_OFF`/`CPU_OFF`), without requesting shutdown first.
    pub fn wait(self) -> Result<()> {
        self.vcpu_handle.join().map_err(Error::Vcpu)
    }
}

fn map_guest_memory(vm: &Vm, guest_mem: &GuestMemoryMmap) -> Result<()> {
    use vm_memory::{GuestMemory, GuestMemoryRegion};

    for region in guest_mem.iter() {
        let host_addr = region
            .get_host_address(vm_memory::MemoryRegionAddress(0))
            .map_err(|e| Error::Memory(anyhow::anyhow!("failed to resolve host address for region: {e}")))?;

        unsafe {
            vm.hvf_vm()
                .map_memory(
                    host_addr,
                    region.start_addr(),
                    region.len() as usize,
                    hvf::MemoryFlags::RWX,
                )
                .map_err(|e| Error::Memory(anyhow::anyhow!("failed to map guest memory: {e}")))?;
        }
    }

    Ok(())
}

/// Assigns SPI `32 + index`, matching `Gic`'s default SPI window
/// (`32..64`).
fn gicv3_spi_for_index(index: usize) -> u32 {
    32 + index as u32
}
