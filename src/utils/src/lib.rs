// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#[macro_use]
extern crate tracing;

pub mod bits;
pub mod gruel;
pub mod kernel_symbols;
pub mod memory;
pub mod os_unfair_lock;
pub mod qos;
pub mod span;

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub mod macos;

pub use os_unfair_lock::{Mutex, MutexGuard};

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub use macos::eventfd;

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub use macos::mach_time;
