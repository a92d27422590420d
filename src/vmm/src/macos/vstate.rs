// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! The vCPU and VM wrappers around Hypervisor.framework's ARM64 API. Each
//! guest gets a single vCPU; PSCI secondary-core bring-up (`CpuOn`/`CpuOff`)
//! is acknowledged but not implemented, since every VM this host boots is
//! single-core.

use std::io;
use std::result;
use std::sync::Arc;
use std::thread;

use arch::ArchMemoryInfo;
use devices::bus::Bus;
use devices::legacy::gic::Gic;
use hvf::{HvfVcpu, HvfVm, VcpuExit, VcpuId};
use tracing::{debug, error, warn};
use utils::mach_time::MachAbsoluteTime;
use utils::Mutex;
use vm_memory::{GuestAddress, GuestMemoryMmap};
use vmm_ids::{VmmShutdownPhase, VmmShutdownSignal};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to create vcpu: {0}")]
    VcpuCreate(hvf::Error),
    #[error("failed to set vcpu initial state: {0}")]
    VcpuInitialState(hvf::Error),
    #[error("failed to run vcpu: {0}")]
    VcpuRun(hvf::Error),
    #[error("cannot spawn vcpu thread: {0}")]
    VcpuSpawn(io::Error),
    #[error("failed to create the virtual machine")]
    VmCreate(hvf::Error),
}

pub type Result<T> = result::Result<T, Error>;

/// Owns the Hypervisor.framework VM handle, the virtual GIC and the MMIO
/// bus every device (virtio-mmio transports, the GIC's own distributor and
/// redistributor frames) is registered on.
pub struct Vm {
    hvf_vm: Arc<HvfVm>,
    gic: Option<Arc<Mutex<Gic>>>,
    bus: Bus,
    shutdown: VmmShutdownSignal,
}

impl Vm {
    pub fn new(mem_info: &ArchMemoryInfo, shutdown: VmmShutdownSignal) -> Result<Self> {
        let hvf_vm = Arc::new(HvfVm::new(mem_info).map_err(Error::VmCreate)?);

        Ok(Vm {
            hvf_vm,
            gic: None,
            bus: Bus::new(),
            shutdown,
        })
    }

    pub fn hvf_vm(&self) -> &Arc<HvfVm> {
        &self.hvf_vm
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    /// Builds the virtual GIC and registers its distributor/redistributor
    /// MMIO frames on the bus. A no-op (returning `Ok(None)`) on hosts
    /// without native GIC support in Hypervisor.framework.
    pub fn setup_irqchip(&mut self, vcpu_count: usize) -> Result<Option<Arc<Mutex<Gic>>>> {
        let Some(gic) = Gic::new(self.hvf_vm.clone(), vcpu_count) else {
            warn!("host has no native GIC support; interrupts will not be delivered");
            return Ok(None);
        };
        let gic = Arc::new(Mutex::new(gic));

        let (dist_base, dist_size, redist_base, redist_size) = {
            let g = gic.lock().unwrap();
            (g.dist_base(), g.dist_size(), g.redist_base(), g.redist_size())
        };

        self.bus
            .insert(Gic::distributor(gic.clone()), dist_base, dist_size)
            .expect("GIC distributor overlaps an existing bus device");
        self.bus
            .insert(Gic::redistributor(gic.clone()), redist_base, redist_size)
            .expect("GIC redistributor overlaps an existing bus device");

        self.gic = Some(gic.clone());
        Ok(Some(gic))
    }

    pub fn gic(&self) -> Option<&Arc<Mutex<Gic>>> {
        self.gic.as_ref()
    }

    /// Registers a virtio-mmio transport's window on the bus.
    pub fn register_mmio_device(
        &mut self,
        device: Arc<Mutex<crate::mmio::MmioTransport>>,
        base: u64,
        len: u64,
    ) {
        self.bus
            .insert(device, base, len)
            .expect("virtio-mmio device overlaps an existing bus device");
    }

    pub fn shutdown_signal(&self) -> &VmmShutdownSignal {
        &self.shutdown
    }
}

/// A running vCPU's view of the devices it needs to dispatch MMIO traps and
/// deliver interrupts to.
pub struct Vcpu {
    index: u8,
    hvf_vcpu: HvfVcpu,
    bus: Bus,
    gic: Option<Arc<Mutex<Gic>>>,
}

impl Vcpu {
    pub fn new(
        index: u8,
        guest_mem: GuestMemoryMmap,
        hvf_vm: Arc<HvfVm>,
        bus: Bus,
        gic: Option<Arc<Mutex<Gic>>>,
    ) -> Result<Self> {
        let hvf_vcpu = HvfVcpu::new(guest_mem, hvf_vm).map_err(Error::VcpuCreate)?;

        Ok(Vcpu {
            index,
            hvf_vcpu,
            bus,
            gic,
        })
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn id(&self) -> VcpuId {
        VcpuId(self.index as u64)
    }

    pub fn configure(&mut self, entry_addr: GuestAddress) -> Result<()> {
        let mpidr = self.id().to_mpidr();
        self.hvf_vcpu
            .set_initial_state(entry_addr.raw_value(), mpidr)
            .map_err(Error::VcpuInitialState)
    }

    /// Runs until the guest requests shutdown/power-off or the VMM asks it
    /// to stop via `shutdown`.
    pub fn run_loop(&mut self, shutdown: VmmShutdownSignal) -> Result<()> {
        let vcpu_ref = self.hvf_vcpu.vcpu_ref();
        let stopping = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stopping_for_kick = stopping.clone();

        let task = shutdown
            .spawn(VmmShutdownPhase::VcpuPause, move || {
                stopping_for_kick.store(true, std::sync::atomic::Ordering::SeqCst);
                if let Err(e) = HvfVcpu::request_exit(vcpu_ref) {
                    error!("failed to request vcpu exit: {:?}", e);
                }
            })
            .ok();

        loop {
            if stopping.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }

            // Native GIC support delivers interrupts out of band (see
            // `Gic::set_irq`); this path never needs manual injection.
            let exit = self.hvf_vcpu.run(None).map_err(Error::VcpuRun)?;
            match exit {
                VcpuExit::Canceled => {
                    if stopping.load(std::sync::atomic::Ordering::SeqCst) {
                        break;
                    }
                    // spuriously canceled (e.g. by another vcpu's force_exits); keep going.
                }
                VcpuExit::Shutdown => {
                    debug!("vcpu {} saw guest-initiated shutdown", self.index);
                    break;
                }
                VcpuExit::CpuOff => {
                    debug!("vcpu {} went offline", self.index);
                    break;
                }
                VcpuExit::CpuOn(..) => {
                    warn!("ignoring PSCI CPU_ON: secondary cores are not supported");
                }
                VcpuExit::HypervisorCall | VcpuExit::SecureMonitorCall | VcpuExit::Breakpoint => {}
                VcpuExit::MmioRead(addr, data) => {
                    if !self.bus.read(self.index as u64, addr, data) {
                        warn!("unhandled mmio read at {:#x}", addr);
                    }
                }
                VcpuExit::MmioWrite(addr, data) => {
                    if !self.bus.write(self.index as u64, addr, data) {
                        warn!("unhandled mmio write at {:#x}", addr);
                    }
                }
                VcpuExit::SystemRegister {
                    sys_reg,
                    is_read,
                    ..
                } => {
                    if is_read {
                        let _ = self.bus.read_sysreg(self.index as u64, sys_reg);
                    } else {
                        self.bus.write_sysreg(self.index as u64, sys_reg, 0);
                    }
                }
                VcpuExit::VtimerActivated => {
                    // The native GIC model delivers the timer PPI itself;
                    // nothing to forward here.
                }
                VcpuExit::WaitForEvent => {
                    thread::yield_now();
                }
                VcpuExit::WaitForEventDeadline(deadline) => {
                    wait_with_shutdown_check(deadline, &stopping);
                }
            }
        }

        drop(task);
        Ok(())
    }

    pub fn gic(&self) -> Option<&Arc<Mutex<Gic>>> {
        self.gic.as_ref()
    }
}

/// Sleeps until `deadline`, checking every 10ms whether the VMM wants this
/// vCPU to stop so a WFE-with-timeout doesn't block shutdown indefinitely.
fn wait_with_shutdown_check(deadline: MachAbsoluteTime, stopping: &std::sync::atomic::AtomicBool) {
    const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);

    loop {
        if stopping.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        match deadline.duration_until_now() {
            None => return,
            Some(remaining) if remaining < POLL_INTERVAL => {
                deadline.wait_until();
                return;
            }
            Some(_) => thread::sleep(POLL_INTERVAL),
        }
    }
}

pub struct VcpuHandle {
    thread: thread::JoinHandle<Result<()>>,
}

impl VcpuHandle {
    pub fn spawn(
        mut vcpu: Vcpu,
        entry_addr: GuestAddress,
        shutdown: VmmShutdownSignal,
    ) -> Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("vcpu{}", vcpu.index()))
            .spawn(move || {
                vcpu.configure(entry_addr)?;
                vcpu.run_loop(shutdown)
            })
            .map_err(Error::VcpuSpawn)?;

        Ok(VcpuHandle { thread })
    }

    pub fn join(self) -> Result<()> {
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => {
                error!("vcpu thread panicked");
                Ok(())
            }
        }
    }
}
