//! GICv3 MMIO surface emulation.
//!
//! Only the registers a Linux guest actually probes during GICv3 discovery
//! and redistributor wake-up are backed by state; everything else reads as
//! zero and ignores writes (see `mmio_read`/`mmio_write`).

use std::mem::{offset_of, size_of};

use crate::mmio::{GicdCtlr, GICD, GICR, SGI};
use crate::mmio_util::BitPack32;

/// A GICv3 interrupt id (INTID). SPIs start at 32.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct InterruptId(pub u32);

/// Index of a processing element (vCPU) within the GIC's redistributor set.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PeId(pub usize);

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum GicError {
    #[error("unsupported SPI line tag {0:#x}")]
    BadTag(u8),
    #[error("INTID {0} outside advertised SPI range")]
    OutOfRange(u32),
}

const GICD_SIZE: usize = size_of::<GICD>();
const GICR_SIZE: usize = size_of::<GICR>();
const SGI_SIZE: usize = size_of::<SGI>();
const REDIST_UNIT_SIZE: usize = GICR_SIZE + SGI_SIZE;

const OFF_CTLR: usize = offset_of!(GICD, ctlr);
const OFF_TYPER: usize = offset_of!(GICD, typer);
const OFF_IIDR: usize = offset_of!(GICD, iidr);
const OFF_TYPER2: usize = offset_of!(GICD, typer2);
const OFF_PIDR2: usize = offset_of!(GICD, id_registers) + offset_of!(
    crate::mmio::CoreLinkIdRegisters,
    pidr2
);

const OFF_RD_CTLR: usize = offset_of!(GICR, ctlr);
const OFF_RD_IIDR: usize = offset_of!(GICR, iidr);
const OFF_RD_TYPER: usize = offset_of!(GICR, typer);
const OFF_RD_WAKER: usize = offset_of!(GICR, waker);
const OFF_RD_PIDR2: usize = offset_of!(GICR, id_registers) + offset_of!(
    crate::mmio::CoreLinkIdRegisters,
    pidr2
);

const GICV3_ARCHREV: u32 = 3;
const JEP106_ARM: u32 = 0x43b;
const PIDR2_GICV3: u32 = 0x30;

/// SPI line tag used by the encoded-IRQ-line calling convention.
const SPI_TAG_RAW: u8 = 0;
const SPI_TAG_SPI: u8 = 1;

/// Emulated GICv3 MMIO state: one distributor, `vcpu_count` redistributors.
pub struct GicV3 {
    vcpu_count: usize,
    spi_base: u32,
    spi_count: u32,
    ctlr: GicdCtlr,
    waker: Vec<u32>,
}

impl GicV3 {
    pub fn new(vcpu_count: usize, spi_base: u32, spi_count: u32) -> Self {
        Self {
            vcpu_count,
            spi_base,
            spi_count,
            ctlr: GicdCtlr::empty(),
            // guests observe redistributors as asleep until they clear ProcessorSleep.
            waker: vec![(Waker_PROCESSOR_SLEEP | Waker_CHILDREN_ASLEEP); vcpu_count],
        }
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpu_count
    }

    /// Total size of the distributor MMIO region.
    pub fn distributor_size() -> u64 {
        GICD_SIZE as u64
    }

    /// Total size of the packed redistributor region (all vCPUs).
    pub fn redistributor_region_size(&self) -> u64 {
        (REDIST_UNIT_SIZE * self.vcpu_count) as u64
    }

    /// Decodes a 32-bit encoded IRQ line (high byte = tag, low 16 bits = INTID)
    /// into a validated SPI `InterruptId`.
    pub fn decode_spi_line(&self, encoded: u32) -> Result<InterruptId, GicError> {
        let tag = (encoded >> 24) as u8;
        let intid = encoded & 0xffff;
        match tag {
            SPI_TAG_RAW | SPI_TAG_SPI => {
                if intid < self.spi_base || intid >= self.spi_base + self.spi_count {
                    Err(GicError::OutOfRange(intid))
                } else {
                    Ok(InterruptId(intid))
                }
            }
            other => Err(GicError::BadTag(other)),
        }
    }

    /// Handles an MMIO read against the distributor region.
    pub fn read_distributor(&self, offset: u64, buf: &mut [u8]) {
        let offset = offset as usize;
        let value: u32 = match offset {
            o if o == OFF_CTLR => self.ctlr.bits(),
            o if o == OFF_TYPER => self.typer_value(),
            o if o == OFF_IIDR => JEP106_ARM,
            o if o == OFF_TYPER2 => 0,
            o if o == OFF_PIDR2 => PIDR2_GICV3,
            _ => 0,
        };
        copy_le(buf, value);
    }

    /// Handles an MMIO write against the distributor region.
    pub fn write_distributor(&mut self, offset: u64, buf: &[u8]) {
        if offset as usize == OFF_CTLR {
            self.ctlr = GicdCtlr::from_bits_retain(read_le(buf));
        }
        // every other register is write-ignored.
    }

    /// Handles an MMIO read against redistributor `pe`'s RD_base frame.
    pub fn read_redistributor(&self, pe: PeId, offset: u64, buf: &mut [u8]) {
        let offset = offset as usize;
        let value: u64 = match offset {
            o if o == OFF_RD_CTLR => 0,
            o if o == OFF_RD_IIDR => JEP106_ARM as u64,
            o if o == OFF_RD_TYPER => self.redistributor_typer(pe),
            o if o == OFF_RD_WAKER => self.waker[pe.0] as u64,
            o if o == OFF_RD_PIDR2 => PIDR2_GICV3 as u64,
            _ => 0,
        };
        match buf.len() {
            8 => buf.copy_from_slice(&value.to_le_bytes()),
            _ => copy_le(buf, value as u32),
        }
    }

    /// Handles an MMIO write against redistributor `pe`'s RD_base frame.
    pub fn write_redistributor(&mut self, pe: PeId, offset: u64, buf: &[u8]) {
        if offset as usize == OFF_RD_WAKER {
            let written = read_le(buf);
            let processor_sleep = written & Waker_PROCESSOR_SLEEP != 0;
            let mut bits = BitPack32(self.waker[pe.0]);
            bits.set_bit(1, processor_sleep); // ProcessorSleep
            if !processor_sleep {
                bits.set_bit(2, false); // clearing ProcessorSleep clears ChildrenAsleep too
            }
            self.waker[pe.0] = bits.0;
        }
        // SGI_base (PIDR2 only, read-only) and everything else is write-ignored.
    }

    fn typer_value(&self) -> u32 {
        // ITLinesNumber = ceil(spi_count/32) - 1, clamped so the field never exceeds its
        // architectural max of 30 (1024 SPIs).
        let it_lines = ((self.spi_count + 31) / 32).saturating_sub(1).min(30);
        let cpu_number = ((self.vcpu_count.saturating_sub(1)) & 0b111) as u32;
        const SECURITY_EXTN: u32 = 1 << 10;
        it_lines | (cpu_number << 5) | SECURITY_EXTN
    }

    fn redistributor_typer(&self, pe: PeId) -> u64 {
        let proc_num = (pe.0 as u64 & 0xffff) << 8;
        let last = if pe.0 + 1 == self.vcpu_count { 1u64 << 4 } else { 0 };
        let affinity = (pe.0 as u64) << 32;
        proc_num | last | affinity
    }
}

const Waker_PROCESSOR_SLEEP: u32 = 1 << 1;
const Waker_CHILDREN_ASLEEP: u32 = 1 << 2;

fn copy_le(buf: &mut [u8], value: u32) {
    let bytes = value.to_le_bytes();
    let n = buf.len().min(4);
    buf[..n].copy_from_slice(&bytes[..n]);
}

fn read_le(buf: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    let n = buf.len().min(4);
    bytes[..n].copy_from_slice(&buf[..n]);
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typer_reports_clamped_lines_and_cpu_count() {
        let gic = GicV3::new(4, 32, 64);
        let typer = gic.typer_value();
        assert_eq!(typer & 0b11111, 1); // ceil(64/32)-1 = 1
        assert_eq!((typer >> 5) & 0b111, 3); // 4 vcpus - 1
    }

    #[test]
    fn waker_clears_children_asleep_with_processor_sleep() {
        let mut gic = GicV3::new(1, 32, 32);
        assert_eq!(gic.waker[0], Waker_PROCESSOR_SLEEP | Waker_CHILDREN_ASLEEP);
        gic.write_redistributor(PeId(0), OFF_RD_WAKER as u64, &0u32.to_le_bytes());
        assert_eq!(gic.waker[0], 0);
    }

    #[test]
    fn decode_spi_line_rejects_out_of_range() {
        let gic = GicV3::new(1, 32, 32);
        assert!(gic.decode_spi_line(32).is_ok());
        assert!(matches!(
            gic.decode_spi_line(200),
            Err(GicError::OutOfRange(200))
        ));
        assert!(matches!(
            gic.decode_spi_line(0x02_00_0020),
            Err(GicError::BadTag(2))
        ));
    }
}
