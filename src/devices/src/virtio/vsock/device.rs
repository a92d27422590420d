use bitflags::bitflags;
use gruel::{define_waker_set, BoundSignalChannelRef, ParkWaker, SignalChannel};
use newt::{make_bit_flag_range, BitFlagRange};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::thread::JoinHandle;

use virtio_bindings::{virtio_config::VIRTIO_F_VERSION_1, virtio_ring::VIRTIO_RING_F_EVENT_IDX};
use vm_memory::GuestMemoryMmap;

use super::super::{ActivateResult, DeviceState, Queue as VirtQueue, VirtioDevice, VirtioShmRegion};
use super::host::VsockShared;
use super::worker::VsockWorker;
use crate::legacy::Gic;
use crate::virtio::VirtioQueueSignals;
use utils::Mutex;

define_waker_set! {
    #[derive(Default)]
    pub(crate) struct VsockWakers {
        park: ParkWaker,
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
    pub(crate) struct VsockSignalMask: u64 {
        const INTERRUPT = 1 << 0;
        const SHUTDOWN_WORKER = 1 << 1;
        const OUTBOUND = 1 << 2;
        const QUEUES = u64::MAX << 3;
    }
}

pub(crate) const VSOCK_QUEUE_SIGS: BitFlagRange<VsockSignalMask> =
    make_bit_flag_range!(mask VsockSignalMask::QUEUES);

pub(crate) type VsockSignalChannel = SignalChannel<VsockSignalMask, VsockWakers>;

mod defs {
    pub const NUM_QUEUES: usize = 2;
    pub const QUEUE_SIZES: &[u16] = &[256; NUM_QUEUES];
    pub const RX_INDEX: usize = 0;
    pub const TX_INDEX: usize = 1;

    pub mod uapi {
        pub const VIRTIO_ID_VSOCK: u32 = 19;
    }
}

pub use defs::uapi::VIRTIO_ID_VSOCK as TYPE_VSOCK;
pub(crate) use defs::{RX_INDEX, TX_INDEX};

/// The host-exec command channel's virtio transport: a cut-down
/// virtio-vsock carrying only what [`super::VsockChannel`] needs —
/// host-initiated stream connections, no credit accounting.
pub struct VsockDevice {
    queues: Vec<VirtQueue>,
    signals: Arc<VsockSignalChannel>,
    avail_features: u64,
    acked_features: u64,
    interrupt_status: Arc<AtomicUsize>,
    intc: Option<Arc<Mutex<Gic>>>,
    irq_line: Option<u32>,
    device_state: DeviceState,
    worker_thread: Option<JoinHandle<()>>,
    shared: Arc<VsockShared>,
}

impl VsockDevice {
    pub fn new() -> Self {
        let queues: Vec<VirtQueue> = defs::QUEUE_SIZES.iter().map(|&max_size| VirtQueue::new(max_size)).collect();
        let signals = Arc::new(SignalChannel::new(VsockWakers::default()));
        VsockDevice {
            queues,
            shared: Arc::new(VsockShared::new(signals.clone())),
            signals,
            avail_features: (1u64 << VIRTIO_F_VERSION_1) | (1u64 << VIRTIO_RING_F_EVENT_IDX),
            acked_features: 0,
            interrupt_status: Arc::new(AtomicUsize::new(0)),
            intc: None,
            irq_line: None,
            device_state: DeviceState::Inactive,
            worker_thread: None,
        }
    }

    pub fn set_intc(&mut self, intc: Arc<Mutex<Gic>>) {
        self.intc = Some(intc);
    }

    pub fn set_shm_region(&mut self, _shm_region: VirtioShmRegion) {}

    /// Handle onto the connect/send/recv API, independent of the
    /// device's own lifecycle.
    pub fn shared(&self) -> Arc<VsockShared> {
        self.shared.clone()
    }
}

impl Default for VsockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtioDevice for VsockDevice {
    fn avail_features(&self) -> u64 {
        self.avail_features
    }

    fn acked_features(&self) -> u64 {
        self.acked_features
    }

    fn set_acked_features(&mut self, acked_features: u64) {
        self.acked_features = acked_features
    }

    fn device_type(&self) -> u32 {
        TYPE_VSOCK
    }

    fn queues(&self) -> &[VirtQueue] {
        &self.queues
    }

    fn queues_mut(&mut self) -> &mut [VirtQueue] {
        &mut self.queues
    }

    fn queue_signals(&self) -> VirtioQueueSignals {
        VirtioQueueSignals::new(self.signals.clone(), VSOCK_QUEUE_SIGS)
    }

    fn interrupt_signal(&self) -> BoundSignalChannelRef<'_> {
        BoundSignalChannelRef::new(&*self.signals, VsockSignalMask::INTERRUPT)
    }

    fn interrupt_status(&self) -> Arc<AtomicUsize> {
        self.interrupt_status.clone()
    }

    fn set_irq_line(&mut self, irq: u32) {
        self.irq_line = Some(irq);
    }

    fn read_config(&self, _offset: u64, _data: &mut [u8]) {}

    fn write_config(&mut self, _offset: u64, _data: &[u8]) {}

    fn activate(&mut self, mem: GuestMemoryMmap) -> ActivateResult {
        if self.worker_thread.is_some() {
            panic!("virtio_vsock: worker thread already exists");
        }

        let event_idx = (self.acked_features & (1 << VIRTIO_RING_F_EVENT_IDX)) != 0;
        self.queues[RX_INDEX].set_event_idx(event_idx);
        self.queues[TX_INDEX].set_event_idx(event_idx);

        let worker = VsockWorker::new(
            self.signals.clone(),
            self.queues.clone(),
            self.interrupt_status.clone(),
            self.intc.clone(),
            self.irq_line,
            mem.clone(),
            self.shared.clone(),
        );
        self.worker_thread = Some(worker.run());
        self.device_state = DeviceState::Activated(mem);
        Ok(())
    }

    fn is_activated(&self) -> bool {
        matches!(self.device_state, DeviceState::Activated(_))
    }

    fn reset(&mut self) -> bool {
        if let Some(worker) = self.worker_thread.take() {
            self.signals.assert(VsockSignalMask::SHUTDOWN_WORKER);
            if let Err(e) = worker.join() {
                tracing::error!("error waiting for vsock worker thread: {:?}", e);
            }
        }
        self.device_state = DeviceState::Inactive;
        true
    }
}
