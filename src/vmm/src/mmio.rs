//! virtio-mmio v2 transport: the guest-visible register file a virtio
//! device sits behind. Devices only implement `devices::virtio::VirtioDevice`;
//! this is where queue setup, feature negotiation and the status register
//! turn into calls on it, per the comment on that trait.

use vm_memory::{GuestAddress, GuestMemoryMmap};

use devices::bus::BusDevice;
use devices::virtio::VirtioDevice;

const MAGIC_VALUE: u32 = 0x7472_6976;
const VERSION: u32 = 2;
const VENDOR_ID: u32 = 0x0000_6f72; // "or" as in orchestrator

const STATUS_ACKNOWLEDGE: u32 = 1;
const STATUS_DRIVER_OK: u32 = 4;
const STATUS_FEATURES_OK: u32 = 8;
const STATUS_FAILED: u32 = 128;

/// The length of the register window before device-specific config space.
pub const MMIO_CONFIG_OFFSET: u64 = 0x100;
/// Per-device MMIO window size this transport reserves on the bus.
pub const MMIO_WINDOW_SIZE: u64 = 0x1000;

#[derive(Default)]
struct QueueStaging {
    desc_low: u32,
    desc_high: u32,
    driver_low: u32,
    driver_high: u32,
    device_low: u32,
    device_high: u32,
}

pub struct MmioTransport {
    device: Box<dyn VirtioDevice>,
    mem: Option<GuestMemoryMmap>,
    status: u32,
    queue_sel: u32,
    device_features_sel: u32,
    driver_features_sel: u32,
    staging: QueueStaging,
}

impl MmioTransport {
    pub fn new(device: Box<dyn VirtioDevice>) -> Self {
        MmioTransport {
            device,
            mem: None,
            status: 0,
            queue_sel: 0,
            device_features_sel: 0,
            driver_features_sel: 0,
            staging: QueueStaging::default(),
        }
    }

    /// The memory the device activates over once the driver sets
    /// `DRIVER_OK`. Set once, at boot, since this crate never hot-adds RAM.
    pub fn set_memory(&mut self, mem: GuestMemoryMmap) {
        self.mem = Some(mem);
    }

    pub fn device(&self) -> &dyn VirtioDevice {
        self.device.as_ref()
    }

    fn read_reg(&mut self, offset: u64, data: &mut [u8]) {
        let value = match offset {
            0x000 => MAGIC_VALUE,
            0x004 => VERSION,
            0x008 => self.device.device_type(),
            0x00c => VENDOR_ID,
            0x010 => {
                let shift = self.device_features_sel * 32;
                (self.device.avail_features() >> shift) as u32
            }
            0x034 => self.device.queues().get(self.queue_sel as usize).map_or(0, |q| q.max_size() as u32),
            0x044 => self.device.queues().get(self.queue_sel as usize).map_or(0, |q| q.ready as u32),
            0x060 => self.device.interrupt_status().load(std::sync::atomic::Ordering::SeqCst) as u32,
            0x070 => self.status,
            0x0fc => 0,
            _ => 0,
        };
        data[..data.len().min(4)].copy_from_slice(&value.to_le_bytes()[..data.len().min(4)]);
    }

    fn write_reg(&mut self, offset: u64, data: &[u8]) {
        let mut buf = [0u8; 4];
        buf[..data.len().min(4)].copy_from_slice(&data[..data.len().min(4)]);
        let value = u32::from_le_bytes(buf);

        match offset {
            0x014 => self.device_features_sel = value,
            0x020 => {
                let shift = self.driver_features_sel * 32;
                let mut acked = self.device.acked_features();
                acked = (acked & !(0xffff_ffffu64 << shift)) | ((value as u64) << shift);
                self.device.set_acked_features(acked);
            }
            0x024 => self.driver_features_sel = value,
            0x030 => self.queue_sel = value,
            0x038 => {
                if let Some(q) = self.device.queues_mut().get_mut(self.queue_sel as usize) {
                    q.size = value as u16;
                }
            }
            0x044 => {
                if let Some(q) = self.device.queues_mut().get_mut(self.queue_sel as usize) {
                    q.ready = value != 0;
                }
            }
            0x050 => self.device.queue_signals().notify(self.queue_sel as usize),
            0x064 => {
                self.device
                    .interrupt_status()
                    .fetch_and(!(value as usize), std::sync::atomic::Ordering::SeqCst);
            }
            0x070 => self.write_status(value),
            0x080 => self.staging.desc_low = value,
            0x084 => {
                self.staging.desc_high = value;
                self.set_queue_addr(|q| &mut q.desc_table, self.staging.desc_low, value);
            }
            0x090 => self.staging.driver_low = value,
            0x094 => {
                self.staging.driver_high = value;
                self.set_queue_addr(|q| &mut q.avail_ring, self.staging.driver_low, value);
            }
            0x0a0 => self.staging.device_low = value,
            0x0a4 => {
                self.staging.device_high = value;
                self.set_queue_addr(|q| &mut q.used_ring, self.staging.device_low, value);
            }
            _ => {}
        }
    }

    fn set_queue_addr(
        &mut self,
        field: impl Fn(&mut devices::virtio::Queue) -> &mut GuestAddress,
        low: u32,
        high: u32,
    ) {
        if let Some(q) = self.device.queues_mut().get_mut(self.queue_sel as usize) {
            *field(q) = GuestAddress(((high as u64) << 32) | low as u64);
        }
    }

    fn write_status(&mut self, value: u32) {
        if value == 0 {
            self.device.reset();
            self.status = 0;
            return;
        }

        let was_ready = self.status & STATUS_DRIVER_OK != 0;
        self.status = value;

        if value & STATUS_FAILED != 0 {
            self.device.reset();
            return;
        }

        if !was_ready && value & STATUS_DRIVER_OK != 0 && value & STATUS_FEATURES_OK != 0 {
            if let Some(mem) = self.mem.clone() {
                if let Err(e) = self.device.activate(mem) {
                    tracing::error!("virtio device activation failed: {:?}", e);
                    self.status |= STATUS_FAILED;
                }
            }
        }
    }
}

impl BusDevice for MmioTransport {
    fn read(&mut self, _vcpuid: u64, offset: u64, data: &mut [u8]) {
        if offset >= MMIO_CONFIG_OFFSET {
            self.device.read_config(offset - MMIO_CONFIG_OFFSET, data);
        } else {
            self.read_reg(offset, data);
        }
    }

    fn write(&mut self, _vcpuid: u64, offset: u64, data: &[u8]) {
        if offset >= MMIO_CONFIG_OFFSET {
            self.device.write_config(offset - MMIO_CONFIG_OFFSET, data);
        } else if offset == 0x000 && self.status == 0 {
            // ACKNOWLEDGE is implicit: the driver only gets here by having
            // already read the magic/version/device-id registers.
            self.status = STATUS_ACKNOWLEDGE;
            let _ = data;
        } else {
            self.write_reg(offset, data);
        }
    }
}
