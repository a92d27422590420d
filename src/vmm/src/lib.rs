// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! VM orchestration: allocates guest memory, stands up the virtual GIC and
//! the virtio-mmio transports, and runs the guest's single vCPU.
//!
//! Hypervisor.framework is macOS-only, so the actual orchestration
//! (`VmSession`, `RunningVm`, the vCPU run loop) lives in [`macos`] and is
//! re-exported here. Loading a kernel image into guest memory and building
//! whatever the guest's boot protocol needs (command line, device tree)
//! happens before a `VmSession` is built; this crate only owns what the
//! hypervisor needs running once the image is in place.

pub mod mmio;
pub mod vmm_config;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "macos")]
pub use macos::{Error, MmioSlot, Result, RunningVm, VmSession, VIRTIO_MMIO_BASE};
