// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The virtual GICv3: MMIO register state lives in [`gicv3::GicV3`], actual
//! interrupt delivery to a running vCPU is handed off to Hypervisor.framework's
//! own virtual GIC via [`hvf::HvfVm::signal_spi`].

use std::sync::Arc;

use gicv3::GicV3;
use hvf::HvfVm;
use tracing::error;
use utils::Mutex;

use crate::bus::BusDevice;

/// SPIs start at INTID 32 (0-15 are SGIs, 16-31 PPIs); this is the usual
/// range a small aarch64 virtio-mmio guest needs one line per device.
const SPI_BASE: u32 = 32;
const SPI_COUNT: u32 = 32;

pub struct Gic {
    hvf_vm: Arc<HvfVm>,
    mmio: GicV3,
    dist_base: u64,
    redist_base: u64,
}

impl Gic {
    /// Builds the virtual GIC from the layout Hypervisor.framework reported
    /// when `hvf_vm` was created. Returns `None` on hosts without native GIC
    /// support (macOS < 15, or non-Apple-Silicon).
    pub fn new(hvf_vm: Arc<HvfVm>, vcpu_count: usize) -> Option<Self> {
        let layout = hvf_vm.gic_layout()?;
        Some(Gic {
            hvf_vm,
            mmio: GicV3::new(vcpu_count, SPI_BASE, SPI_COUNT),
            dist_base: layout.dist_base,
            redist_base: layout.redist_base,
        })
    }

    pub fn dist_base(&self) -> u64 {
        self.dist_base
    }

    pub fn dist_size(&self) -> u64 {
        GicV3::distributor_size()
    }

    pub fn redist_base(&self) -> u64 {
        self.redist_base
    }

    pub fn redist_size(&self) -> u64 {
        self.mmio.redistributor_region_size()
    }

    /// Asserts SPI line `irq_line` on the host's real (hardware-assisted)
    /// virtual GIC. `irq_line` is whatever was handed to the device via
    /// `VirtioDevice::set_irq_line`, validated here against the advertised
    /// SPI range before being forwarded to Hypervisor.framework.
    pub fn set_irq(&mut self, irq_line: u32) {
        match self.mmio.decode_spi_line(irq_line) {
            Ok(id) => {
                if let Err(e) = self.hvf_vm.signal_spi(id.0, true) {
                    error!("failed to signal spi {}: {:?}", id.0, e);
                }
            }
            Err(e) => error!("bad irq line {:#x}: {:?}", irq_line, e),
        }
    }

    /// A view onto the distributor MMIO frame, to register on the bus at
    /// [`Gic::dist_base`].
    pub fn distributor(gic: Arc<Mutex<Gic>>) -> GicDistributor {
        GicDistributor(gic)
    }

    /// A view onto the packed redistributor MMIO frames, to register on the
    /// bus at [`Gic::redist_base`].
    pub fn redistributor(gic: Arc<Mutex<Gic>>) -> GicRedistributor {
        GicRedistributor(gic)
    }
}

#[derive(Clone)]
pub struct GicDistributor(Arc<Mutex<Gic>>);

impl BusDevice for GicDistributor {
    fn read(&mut self, _vcpuid: u64, offset: u64, data: &mut [u8]) {
        self.0.lock().unwrap().mmio.read_distributor(offset, data);
    }

    fn write(&mut self, _vcpuid: u64, offset: u64, data: &[u8]) {
        self.0.lock().unwrap().mmio.write_distributor(offset, data);
    }
}

#[derive(Clone)]
pub struct GicRedistributor(Arc<Mutex<Gic>>);

impl BusDevice for GicRedistributor {
    fn read(&mut self, vcpuid: u64, offset: u64, data: &mut [u8]) {
        self.0
            .lock()
            .unwrap()
            .mmio
            .read_redistributor(gicv3::PeId(vcpuid as usize), offset, data);
    }

    fn write(&mut self, vcpuid: u64, offset: u64, data: &[u8]) {
        self.0
            .lock()
            .unwrap()
            .mmio
            .write_redistributor(gicv3::PeId(vcpuid as usize), offset, data);
    }
}
