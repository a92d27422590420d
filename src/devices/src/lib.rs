// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Virtual device models: the MMIO bus, the GICv3 interrupt controller, and
//! the virtio device stack (currently just virtio-fs) that plug into it.

#[macro_use]
extern crate tracing;

pub mod bus;
pub mod hvc;
pub mod legacy;
pub mod virtio;

pub use bus::{Bus, BusDevice, ErasedBusDevice, LocklessBusDevice};
pub use hvc::HvcDevice;
