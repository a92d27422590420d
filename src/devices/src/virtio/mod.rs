// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Virtio device model: the transport-agnostic bits shared by every device
//! behind an MMIO virtio-mmio window (queues, feature negotiation, the
//! interrupt/notification contract). Each device under this module only
//! implements [`VirtioDevice`]; the MMIO register layout itself lives with
//! the VMM's bus wiring.

pub mod descriptor_utils;
pub mod fs;
pub mod queue;
pub mod vsock;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use gruel::{BoundSignalChannelRef, SignalChannel, WakerSet};
use newt::BitFlagRange;
use vm_memory::GuestMemoryMmap;

pub use self::fs::{FsError, TYPE_FS};
pub use self::queue::{DescriptorChain, DescriptorChainExt, Queue};
pub use self::vsock::{VsockChannel, VsockDevice, VsockError, VsockShared, TYPE_VSOCK};
pub use crate::hvc::HvcDevice;

/// Bit set in the MMIO interrupt-status register when a used-ring entry was
/// posted and the driver should be notified.
pub const VIRTIO_MMIO_INT_VRING: u32 = 0x1;
/// Bit set in the MMIO interrupt-status register after a config-space change.
pub const VIRTIO_MMIO_INT_CONFIG: u32 = 0x2;

#[derive(Debug)]
pub enum ActivateError {
    /// The device's queues were not all marked valid by the driver before
    /// `DRIVER_OK` was set.
    BadActivate,
    EventFd(std::io::Error),
}

pub type ActivateResult = std::result::Result<(), ActivateError>;

/// Lifecycle state of a virtio device as seen by its transport.
pub enum DeviceState {
    Inactive,
    Activated(GuestMemoryMmap),
}

/// The host side of virtio-fs's DAX shared-memory window, if the device
/// negotiated one. Unused until a device actually backs file contents with
/// mmap'd guest-visible memory rather than FUSE read/write round trips.
#[derive(Debug, Clone, Copy)]
pub struct VirtioShmRegion {
    pub host_addr: u64,
    pub guest_addr: u64,
    pub len: u64,
}

/// Per-device view onto its signal channel, type-erased so that
/// [`VirtioDevice::queue_signals`] can return a single concrete type
/// regardless of each device's own signal-mask enum.
pub struct VirtioQueueSignals {
    notifier: Arc<dyn QueueNotifier>,
}

trait QueueNotifier: Send + Sync {
    fn notify(&self, queue_index: usize);
}

struct ChannelNotifier<S, W: ?Sized + WakerSet> {
    signals: Arc<SignalChannel<S, W>>,
    queue_sigs: BitFlagRange<S>,
}

impl<S, W> QueueNotifier for ChannelNotifier<S, W>
where
    S: bitflags::Flags<Bits = u64> + Copy + Send + Sync + 'static,
    W: WakerSet + Send + Sync + ?Sized + 'static,
{
    fn notify(&self, queue_index: usize) {
        self.signals.assert(self.queue_sigs.get(queue_index));
    }
}

impl VirtioQueueSignals {
    pub fn new<S, W>(signals: Arc<SignalChannel<S, W>>, queue_sigs: BitFlagRange<S>) -> Self
    where
        S: bitflags::Flags<Bits = u64> + Copy + Send + Sync + 'static,
        W: WakerSet + Send + Sync + ?Sized + 'static,
    {
        VirtioQueueSignals {
            notifier: Arc::new(ChannelNotifier { signals, queue_sigs }),
        }
    }

    /// Wakes the worker thread owning `queue_index`, as if the driver had
    /// just written to that queue's notify register.
    pub fn notify(&self, queue_index: usize) {
        self.notifier.notify(queue_index);
    }
}

/// Called when the VMM is tearing down, independent of whether the guest
/// driver ever reset the device through its normal status register path.
pub trait VmmExitObserver {
    fn on_vmm_exit(&mut self);
}

/// A virtio device behind an MMIO transport.
///
/// Implementors own their queues and config space but never touch the MMIO
/// register file directly; the transport reads/writes config space and
/// forwards notify-register writes through [`VirtioDevice::queue_signals`].
pub trait VirtioDevice: Send {
    fn device_type(&self) -> u32;

    fn avail_features(&self) -> u64;

    fn acked_features(&self) -> u64;

    fn set_acked_features(&mut self, acked_features: u64);

    fn queues(&self) -> &[Queue];

    fn queues_mut(&mut self) -> &mut [Queue];

    fn queue_signals(&self) -> VirtioQueueSignals;

    fn interrupt_signal(&self) -> BoundSignalChannelRef<'_>;

    fn interrupt_status(&self) -> Arc<AtomicUsize>;

    fn set_irq_line(&mut self, irq: u32);

    fn read_config(&self, offset: u64, data: &mut [u8]);

    fn write_config(&mut self, offset: u64, data: &[u8]);

    fn activate(&mut self, mem: GuestMemoryMmap) -> ActivateResult;

    fn is_activated(&self) -> bool;

    fn shm_region(&self) -> Option<&VirtioShmRegion> {
        None
    }

    /// Tears down the device's worker thread(s) and returns it to
    /// [`DeviceState::Inactive`]. Returns whether the reset actually ran
    /// (e.g. `false` if the device was never activated).
    fn reset(&mut self) -> bool {
        false
    }
}
