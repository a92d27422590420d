// Copyright 2021 Sergio Lopez. All rights reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

//! A tick count from `mach_absolute_time`, plus the host timebase needed to
//! turn it into wall-clock time. Used to honor HVF's `WaitForEventDeadline`
//! vCPU exit, which hands back a raw mach time rather than a `Duration`.

use std::time::Duration;

use mach2::mach_time::{mach_absolute_time, mach_timebase_info, mach_wait_until};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MachAbsoluteTime(u64);

impl MachAbsoluteTime {
    pub fn now() -> Self {
        MachAbsoluteTime(unsafe { mach_absolute_time() })
    }

    pub fn from_raw(ticks: u64) -> Self {
        MachAbsoluteTime(ticks)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Blocks the calling thread until this deadline, or returns
    /// immediately if it has already passed.
    pub fn wait_until(&self) {
        unsafe {
            mach_wait_until(self.0);
        }
    }

    /// How far in the future this deadline is, relative to now. `None` if
    /// it has already passed.
    pub fn duration_until_now(&self) -> Option<Duration> {
        let now = Self::now();
        if self.0 <= now.0 {
            return None;
        }
        Some(ticks_to_duration(self.0 - now.0))
    }
}

fn ticks_to_duration(ticks: u64) -> Duration {
    let mut info = mach_timebase_info { numer: 0, denom: 0 };
    unsafe {
        mach_timebase_info(&mut info);
    }
    let nanos = (ticks as u128) * info.numer as u128 / info.denom as u128;
    Duration::from_nanos(nanos as u64)
}
