// Copyright 2019 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A split virtqueue: descriptor table, available ring, used ring, each a
//! guest-memory-resident structure the driver and device share per the
//! virtio 1.1 spec (2.6).

use std::num::Wrapping;
use std::sync::atomic::{fence, Ordering};

use vm_memory::{Address, ByteValued, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

const VIRTQ_DESC_F_NEXT: u16 = 0x1;
const VIRTQ_DESC_F_WRITE: u16 = 0x2;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
struct Descriptor {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}
unsafe impl ByteValued for Descriptor {}

/// One descriptor in a chain, resolved against guest memory.
#[derive(Clone)]
pub struct DescriptorChain<'a> {
    mem: &'a GuestMemoryMmap,
    desc_table: GuestAddress,
    queue_size: u16,

    pub index: u16,
    pub addr: GuestAddress,
    pub len: u32,
    flags: u16,
    next: u16,
}

impl<'a> DescriptorChain<'a> {
    fn parse(
        mem: &'a GuestMemoryMmap,
        desc_table: GuestAddress,
        queue_size: u16,
        index: u16,
    ) -> Option<DescriptorChain<'a>> {
        if index >= queue_size {
            return None;
        }

        let desc_addr = desc_table.checked_add(u64::from(index) * 16)?;
        let desc: Descriptor = mem.read_obj(desc_addr).ok()?;

        Some(DescriptorChain {
            mem,
            desc_table,
            queue_size,
            index,
            addr: GuestAddress(desc.addr),
            len: desc.len,
            flags: desc.flags,
            next: desc.next,
        })
    }

    pub fn checked_new(
        mem: &'a GuestMemoryMmap,
        desc_table: GuestAddress,
        queue_size: u16,
        index: u16,
    ) -> Option<DescriptorChain<'a>> {
        let chain = Self::parse(mem, desc_table, queue_size, index)?;
        if chain.has_next() && chain.next >= queue_size {
            return None;
        }
        Some(chain)
    }

    fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    fn next_descriptor(&self) -> Option<DescriptorChain<'a>> {
        if !self.has_next() {
            return None;
        }
        Self::parse(self.mem, self.desc_table, self.queue_size, self.next)
    }
}

impl<'a> IntoIterator for DescriptorChain<'a> {
    type Item = DescriptorChain<'a>;
    type IntoIter = DescriptorIter<'a>;

    fn into_iter(self) -> DescriptorIter<'a> {
        DescriptorIter { next: Some(self) }
    }
}

pub struct DescriptorIter<'a> {
    next: Option<DescriptorChain<'a>>,
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = DescriptorChain<'a>;

    fn next(&mut self) -> Option<DescriptorChain<'a>> {
        let current = self.next.take()?;
        self.next = current.next_descriptor();
        Some(current)
    }
}

/// Adaptors restricting a chain's descriptors to the readable (device
/// driver-writable input) or writable (device output) halves. Per the spec,
/// a chain is always readable-then-writable: once a writable descriptor is
/// seen, every descriptor after it is assumed writable too.
pub trait DescriptorChainExt<'a>: Iterator<Item = DescriptorChain<'a>> + Sized {
    fn readable(self) -> std::iter::TakeWhile<Self, fn(&DescriptorChain<'a>) -> bool> {
        self.take_while(|d| !d.is_write_only())
    }

    fn writable(self) -> std::iter::SkipWhile<Self, fn(&DescriptorChain<'a>) -> bool> {
        self.skip_while(|d| !d.is_write_only())
    }
}

impl<'a, I: Iterator<Item = DescriptorChain<'a>>> DescriptorChainExt<'a> for I {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
struct AvailRing {
    flags: u16,
    idx: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
struct UsedElem {
    id: u32,
    len: u32,
}
unsafe impl ByteValued for UsedElem {}

#[derive(Clone)]
pub struct Queue {
    max_size: u16,
    pub size: u16,
    pub ready: bool,

    pub desc_table: GuestAddress,
    pub avail_ring: GuestAddress,
    pub used_ring: GuestAddress,

    next_avail: Wrapping<u16>,
    next_used: Wrapping<u16>,
    event_idx_enabled: bool,
    num_added: Wrapping<u16>,
}

impl Queue {
    pub fn new(max_size: u16) -> Queue {
        Queue {
            max_size,
            size: max_size,
            ready: false,
            desc_table: GuestAddress(0),
            avail_ring: GuestAddress(0),
            used_ring: GuestAddress(0),
            next_avail: Wrapping(0),
            next_used: Wrapping(0),
            event_idx_enabled: false,
            num_added: Wrapping(0),
        }
    }

    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    pub fn is_valid(&self, mem: &GuestMemoryMmap) -> bool {
        let queue_size = u64::from(self.size);
        let desc_table = self.desc_table;
        let desc_table_size = 16 * queue_size;
        let avail_ring = self.avail_ring;
        let avail_ring_size = 6 + 2 * queue_size;
        let used_ring = self.used_ring;
        let used_ring_size = 6 + 8 * queue_size;

        self.size <= self.max_size
            && self.size != 0
            && (self.size & (self.size - 1)) == 0
            && mem.checked_offset(desc_table, desc_table_size as usize).is_some()
            && mem.checked_offset(avail_ring, avail_ring_size as usize).is_some()
            && mem.checked_offset(used_ring, used_ring_size as usize).is_some()
    }

    pub fn set_event_idx(&mut self, enabled: bool) {
        self.event_idx_enabled = enabled;
    }

    fn avail_idx(&self, mem: &GuestMemoryMmap) -> Wrapping<u16> {
        let addr = self.avail_ring.unchecked_add(2);
        Wrapping(mem.read_obj::<u16>(addr).unwrap_or(0))
    }

    fn avail_event_idx_addr(&self) -> GuestAddress {
        self.used_ring.unchecked_add(4 + 8 * u64::from(self.size))
    }

    fn used_event_idx_addr(&self) -> GuestAddress {
        self.avail_ring.unchecked_add(4 + 2 * u64::from(self.size))
    }

    pub fn pop<'a>(&mut self, mem: &'a GuestMemoryMmap) -> Option<DescriptorChain<'a>> {
        let avail_idx = self.avail_idx(mem);
        if self.next_avail == avail_idx {
            return None;
        }

        let offset = 4 + (self.next_avail.0 % self.size) * 2;
        let addr = self.avail_ring.unchecked_add(u64::from(offset));
        let desc_index: u16 = mem.read_obj(addr).ok()?;

        self.next_avail += Wrapping(1);
        DescriptorChain::checked_new(mem, self.desc_table, self.size, desc_index)
    }

    /// Undoes the last `pop`, so the descriptor is returned on the next call.
    pub fn undo_pop(&mut self) {
        self.next_avail -= Wrapping(1);
    }

    pub fn add_used(&mut self, mem: &GuestMemoryMmap, desc_index: u16, len: u32) -> std::io::Result<()> {
        let used_elem = UsedElem {
            id: u32::from(desc_index),
            len,
        };
        let offset = 4 + (self.next_used.0 % self.size) as u64 * 8;
        let addr = self.used_ring.unchecked_add(offset);
        mem.write_obj(used_elem, addr)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        fence(Ordering::Release);

        self.next_used += Wrapping(1);
        self.num_added += Wrapping(1);
        mem.write_obj(self.next_used.0, self.used_ring.unchecked_add(2))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    /// Stops the queue from notifying the device when new descriptors land.
    pub fn disable_notification(&mut self, mem: &GuestMemoryMmap) -> std::io::Result<()> {
        if self.event_idx_enabled {
            let addr = self.used_event_idx_addr();
            mem.write_obj(self.next_avail.0, addr)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        } else {
            Ok(())
        }
    }

    /// Re-enables notifications and reports whether more descriptors were
    /// added to the avail ring while notifications were disabled.
    pub fn enable_notification(&mut self, mem: &GuestMemoryMmap) -> std::io::Result<bool> {
        if self.event_idx_enabled {
            let addr = self.used_event_idx_addr();
            mem.write_obj(self.next_avail.0, addr)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        }
        fence(Ordering::SeqCst);
        Ok(self.avail_idx(mem) != self.next_avail)
    }

    /// Reports whether the driver should be interrupted, honoring
    /// `VIRTIO_RING_F_EVENT_IDX` when negotiated.
    pub fn needs_notification(&mut self, mem: &GuestMemoryMmap) -> std::io::Result<bool> {
        if !self.event_idx_enabled {
            return Ok(true);
        }

        let used_event: u16 = mem.read_obj(self.avail_event_idx_addr()).unwrap_or(0);
        let needs = (self.next_used - Wrapping(used_event) - Wrapping(1)) < self.num_added;
        self.num_added = Wrapping(0);
        Ok(needs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_memory::GuestAddress as GA;

    fn mk_mem() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GA(0), 0x10000)]).unwrap()
    }

    #[test]
    fn pop_returns_none_on_empty_queue() {
        let mem = mk_mem();
        let mut q = Queue::new(8);
        q.desc_table = GA(0);
        q.avail_ring = GA(0x1000);
        q.used_ring = GA(0x2000);
        assert!(q.pop(&mem).is_none());
    }

    #[test]
    fn is_valid_rejects_non_power_of_two_size() {
        let mem = mk_mem();
        let mut q = Queue::new(8);
        q.size = 3;
        q.desc_table = GA(0);
        q.avail_ring = GA(0x1000);
        q.used_ring = GA(0x2000);
        assert!(!q.is_valid(&mem));
    }
}
