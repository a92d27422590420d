// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::debug;
use vm_memory::{GuestAddress, GuestMemoryMmap};

use counter::RateCounter;

use utils::mach_time::MachAbsoluteTime;

use crate::hypercalls::{
    PSCI_AFFINITY_INFO, PSCI_CPU_OFF, PSCI_CPU_ON, PSCI_CPU_SUSPEND, PSCI_DISABLED, PSCI_FEATURES,
    PSCI_MIGRATE_INFO_TYPE, PSCI_NOT_SUPPORTED, PSCI_SUCCESS, PSCI_SYSTEM_OFF, PSCI_SYSTEM_RESET,
    PSCI_VERSION, PSCI_VERSION_1_1,
};

use crate::aarch64::bindings::{
    hv_reg_t_HV_REG_X1, hv_reg_t_HV_REG_X2, hv_reg_t_HV_REG_X3,
    hv_sys_reg_t_HV_SYS_REG_CNTV_CTL_EL0, hv_sys_reg_t_HV_SYS_REG_CNTV_CVAL_EL0,
};

use super::bindings::{
    hv_exit_reason_t_HV_EXIT_REASON_CANCELED, hv_exit_reason_t_HV_EXIT_REASON_EXCEPTION,
    hv_exit_reason_t_HV_EXIT_REASON_VTIMER_ACTIVATED, hv_interrupt_type_t_HV_INTERRUPT_TYPE_FIQ,
    hv_interrupt_type_t_HV_INTERRUPT_TYPE_IRQ, hv_reg_t, hv_reg_t_HV_REG_CPSR, hv_reg_t_HV_REG_FP,
    hv_reg_t_HV_REG_LR, hv_reg_t_HV_REG_PC, hv_reg_t_HV_REG_X0, hv_sys_reg_t,
    hv_sys_reg_t_HV_SYS_REG_MPIDR_EL1, hv_sys_reg_t_HV_SYS_REG_SP_EL1,
    hv_sys_reg_t_HV_SYS_REG_TPIDR_EL1, hv_sys_reg_t_HV_SYS_REG_VBAR_EL1, hv_vcpu_create,
    hv_vcpu_destroy, hv_vcpu_exit_t, hv_vcpu_get_reg, hv_vcpu_get_sys_reg, hv_vcpu_run,
    hv_vcpu_set_pending_interrupt, hv_vcpu_set_reg, hv_vcpu_set_sys_reg, hv_vcpu_set_vtimer_mask,
    hv_vcpu_t, hv_vcpus_exit,
};
use super::{Error, HvfError, HvfVm};

counter::counter! {
    COUNT_EXIT_TOTAL in "hvf.vmexit.total": RateCounter = RateCounter::new(FILTER);
    COUNT_EXIT_HVC in "hvf.vmexit.hvc": RateCounter = RateCounter::new(FILTER);
    COUNT_EXIT_MMIO_READ in "hvf.vmexit.mmio.read": RateCounter = RateCounter::new(FILTER);
    COUNT_EXIT_MMIO_WRITE in "hvf.vmexit.mmio.write": RateCounter = RateCounter::new(FILTER);
    COUNT_EXIT_SYSREG in "hvf.vmexit.sysreg": RateCounter = RateCounter::new(FILTER);
    COUNT_EXIT_WFE_INDEFINITE in "hvf.vmexit.wfe.indefinite": RateCounter = RateCounter::new(FILTER);
    COUNT_EXIT_WFE_TIMED in "hvf.vmexit.wfe.timed": RateCounter = RateCounter::new(FILTER);
    COUNT_EXIT_VTIMER in "hvf.vmexit.vtimer": RateCounter = RateCounter::new(FILTER);
}

const PSR_MODE_EL0T: u64 = 0x0000_0000;
const PSR_MODE_EL1T: u64 = 0x0000_0004;
const PSR_MODE_EL1H: u64 = 0x0000_0005;
const PSR_MODE_MASK: u64 = 0x0000_000f;

const PSR_F_BIT: u64 = 0x0000_0040;
const PSR_I_BIT: u64 = 0x0000_0080;
const PSR_A_BIT: u64 = 0x0000_0100;
const PSR_D_BIT: u64 = 0x0000_0200;
const INITIAL_PSTATE: u64 = PSR_A_BIT | PSR_F_BIT | PSR_I_BIT | PSR_D_BIT | PSR_MODE_EL1H;

const EC_WFX_TRAP: u64 = 0x1;
const EC_AA64_HVC: u64 = 0x16;
const EC_AA64_SMC: u64 = 0x17;
const EC_SYSTEMREGISTERTRAP: u64 = 0x18;
const EC_DATAABORT: u64 = 0x24;
const EC_AA64_BKPT: u64 = 0x3c;

macro_rules! arm64_sys_reg {
    ($name: tt, $op0: tt, $op1: tt, $op2: tt, $crn: tt, $crm: tt) => {
        const $name: u64 = ($op0 as u64) << 20
            | ($op2 as u64) << 17
            | ($op1 as u64) << 14
            | ($crn as u64) << 10
            | ($crm as u64) << 1;
    };
}

arm64_sys_reg!(SYSREG_MASK, 0x3, 0x7, 0x7, 0xf, 0xf);

#[repr(u32)]
pub enum InterruptType {
    Irq = hv_interrupt_type_t_HV_INTERRUPT_TYPE_IRQ,
    Fiq = hv_interrupt_type_t_HV_INTERRUPT_TYPE_FIQ,
}

pub struct VcpuId(pub u64);

impl VcpuId {
    pub fn to_mpidr(&self) -> u64 {
        self.0 << 8
    }
}

#[derive(Debug)]
pub enum VcpuExit<'a> {
    Breakpoint,
    Canceled,
    CpuOn(u64, u64, u64),
    CpuOff,
    HypervisorCall,
    MmioRead(u64, &'a mut [u8]),
    MmioWrite(u64, &'a [u8]),
    SecureMonitorCall,
    Shutdown,
    SystemRegister {
        sys_reg: u64,
        arg_reg_idx: u32,
        is_read: bool,
    },
    VtimerActivated,
    WaitForEvent,
    WaitForEventDeadline(MachAbsoluteTime),
}

struct MmioRead {
    addr: u64,
    len: usize,
    srt: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct HvVcpuRef(hv_vcpu_t);

pub struct HvfVcpu {
    hv_vcpu: HvVcpuRef,
    vcpu_exit_ptr: *mut hv_vcpu_exit_t,
    mmio_buf: [u8; 8],
    pending_mmio_read: Option<MmioRead>,
    pending_advance_pc: bool,

    guest_mem: GuestMemoryMmap,

    _hvf_vm: Arc<HvfVm>,
}

impl HvfVcpu {
    pub fn new(guest_mem: GuestMemoryMmap, hvf_vm: Arc<HvfVm>) -> Result<Self, Error> {
        let mut vcpuid: hv_vcpu_t = 0;
        let mut vcpu_exit_ptr: *mut hv_vcpu_exit_t = std::ptr::null_mut();

        let ret = unsafe {
            hv_vcpu_create(
                &mut vcpuid,
                &mut vcpu_exit_ptr as *mut *mut _,
                std::ptr::null_mut(),
            )
        };
        HvfError::result(ret).map_err(Error::VcpuCreate)?;

        Ok(Self {
            hv_vcpu: HvVcpuRef(vcpuid),
            vcpu_exit_ptr,
            mmio_buf: [0; 8],
            pending_mmio_read: None,
            pending_advance_pc: false,

            guest_mem,

            _hvf_vm: hvf_vm,
        })
    }

    pub fn set_initial_state(&mut self, entry_addr: u64, mpidr: u64) -> Result<(), Error> {
        self.write_raw_reg(hv_reg_t_HV_REG_CPSR, INITIAL_PSTATE)?;

        self.write_raw_reg(hv_reg_t_HV_REG_PC, entry_addr)?;
        self.write_raw_reg(hv_reg_t_HV_REG_X0, 0)?;
        self.write_raw_reg(hv_reg_t_HV_REG_X1, 0)?;
        self.write_raw_reg(hv_reg_t_HV_REG_X2, 0)?;
        self.write_raw_reg(hv_reg_t_HV_REG_X3, 0)?;
        self.write_sys_reg(hv_sys_reg_t_HV_SYS_REG_MPIDR_EL1, mpidr)?;

        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.hv_vcpu.0
    }

    pub fn vcpu_ref(&self) -> HvVcpuRef {
        self.hv_vcpu
    }

    pub fn read_raw_reg(&self, reg: hv_reg_t) -> Result<u64, Error> {
        let mut val: u64 = 0;
        let ret = unsafe { hv_vcpu_get_reg(self.hv_vcpu.0, reg, &mut val) };
        HvfError::result(ret).map_err(Error::VcpuReadRegister)?;
        Ok(val)
    }

    pub fn write_raw_reg(&mut self, reg: hv_reg_t, val: u64) -> Result<(), Error> {
        let ret = unsafe { hv_vcpu_set_reg(self.hv_vcpu.0, reg, val) };
        HvfError::result(ret).map_err(Error::VcpuSetRegister)
    }

    pub fn read_gp_reg(&self, reg: u32) -> Result<u64, Error> {
        assert!(reg < 32);

        if reg == 31 {
            Ok(0)
        } else {
            self.read_raw_reg(hv_reg_t_HV_REG_X0 + reg)
        }
    }

    pub fn write_gp_reg(&mut self, reg: u32, val: u64) -> Result<(), Error> {
        assert!(reg < 32);

        if reg == 31 {
            // ignore attempt to write to xzr
            Ok(())
        } else {
            self.write_raw_reg(hv_reg_t_HV_REG_X0 + reg, val)
        }
    }

    fn read_sys_reg(&self, reg: hv_sys_reg_t) -> Result<u64, Error> {
        let mut val: u64 = 0;
        let ret = unsafe { hv_vcpu_get_sys_reg(self.hv_vcpu.0, reg, &mut val) };
        HvfError::result(ret).map_err(Error::VcpuReadSystemRegister)?;
        Ok(val)
    }

    fn write_sys_reg(&mut self, reg: hv_sys_reg_t, val: u64) -> Result<(), Error> {
        let ret = unsafe { hv_vcpu_set_sys_reg(self.hv_vcpu.0, reg, val) };
        HvfError::result(ret).map_err(Error::VcpuSetSystemRegister)
    }

    pub fn run(&mut self, pending_irq: Option<u32>) -> Result<VcpuExit, Error> {
        // .take() is slower
        if let Some(mmio_read) = &self.pending_mmio_read {
            if mmio_read.srt < 31 {
                let val = match mmio_read.len {
                    1 => u8::from_le_bytes(self.mmio_buf[0..1].try_into().unwrap()) as u64,
                    2 => u16::from_le_bytes(self.mmio_buf[0..2].try_into().unwrap()) as u64,
                    4 => u32::from_le_bytes(self.mmio_buf[0..4].try_into().unwrap()) as u64,
                    8 => u64::from_le_bytes(self.mmio_buf[0..8].try_into().unwrap()),
                    _ => panic!(
                        "unsupported mmio pa={} len={}",
                        mmio_read.addr, mmio_read.len
                    ),
                };

                self.write_raw_reg(hv_reg_t_HV_REG_X0 + mmio_read.srt, val)?;
            }

            self.pending_mmio_read = None;
        }

        if self.pending_advance_pc {
            let pc = self.read_raw_reg(hv_reg_t_HV_REG_PC)?;
            self.write_raw_reg(hv_reg_t_HV_REG_PC, pc + 4)?;
            self.pending_advance_pc = false;
        }

        if let Some(pending_irq) = pending_irq {
            let _ = pending_irq;
            Self::set_pending_irq(self.hv_vcpu, InterruptType::Irq, true)?;
        }

        let ret = unsafe { hv_vcpu_run(self.hv_vcpu.0) };
        HvfError::result(ret).map_err(Error::VcpuRun)?;

        COUNT_EXIT_TOTAL.count();

        let vcpu_exit = unsafe { &*self.vcpu_exit_ptr };
        #[allow(non_upper_case_globals)]
        let exit = match vcpu_exit.reason {
            hv_exit_reason_t_HV_EXIT_REASON_CANCELED => VcpuExit::Canceled,
            hv_exit_reason_t_HV_EXIT_REASON_EXCEPTION => {
                let syndrome = vcpu_exit.exception.syndrome;
                let ec = (syndrome >> 26) & 0x3f;

                match ec {
                    EC_AA64_HVC => self.handle_hvc()?,
                    EC_AA64_SMC => {
                        debug!("SMC exit");
                        self.pending_advance_pc = true;
                        VcpuExit::SecureMonitorCall
                    }
                    EC_SYSTEMREGISTERTRAP => {
                        let is_read: bool = (syndrome & 1) != 0;
                        let arg_reg_idx: u32 = ((syndrome >> 5) & 0x1f) as u32;
                        let sys_reg: u64 = syndrome & SYSREG_MASK;

                        debug!(
                            "sysreg operation reg={} target={} isread={:?}",
                            sys_reg, arg_reg_idx, is_read
                        );

                        COUNT_EXIT_SYSREG.count();
                        self.pending_advance_pc = true;
                        VcpuExit::SystemRegister {
                            sys_reg,
                            arg_reg_idx,
                            is_read,
                        }
                    }
                    EC_DATAABORT => {
                        let iswrite: bool = ((syndrome >> 6) & 1) != 0;
                        let sas: u32 = (syndrome as u32 >> 22) & 3;
                        let len: usize = (1 << sas) as usize;
                        let srt: u32 = (syndrome as u32 >> 16) & 0x1f;

                        let pa = vcpu_exit.exception.physical_address;
                        self.pending_advance_pc = true;

                        if iswrite {
                            let val = if srt < 31 {
                                self.read_raw_reg(hv_reg_t_HV_REG_X0 + srt)?
                            } else {
                                0u64
                            };

                            match len {
                                1 => {
                                    self.mmio_buf[0..1].copy_from_slice(&(val as u8).to_le_bytes())
                                }
                                2 => self.mmio_buf[0..2]
                                    .copy_from_slice(&(val as u16).to_le_bytes()),
                                4 => {
                                    self.mmio_buf[0..4].copy_from_slice(&(val as u32).to_le_bytes())
                                }
                                8 => self.mmio_buf[0..8].copy_from_slice(&val.to_le_bytes()),
                                _ => panic!("unsupported mmio len={len}"),
                            };

                            COUNT_EXIT_MMIO_WRITE.count();
                            VcpuExit::MmioWrite(pa, &self.mmio_buf[0..len])
                        } else {
                            COUNT_EXIT_MMIO_READ.count();
                            self.pending_mmio_read = Some(MmioRead { addr: pa, srt, len });
                            VcpuExit::MmioRead(pa, &mut self.mmio_buf[0..len])
                        }
                    }
                    EC_AA64_BKPT => {
                        debug!("BRK exit");
                        VcpuExit::Breakpoint
                    }
                    EC_WFX_TRAP => {
                        let ctl = self.read_sys_reg(hv_sys_reg_t_HV_SYS_REG_CNTV_CTL_EL0)?;

                        self.pending_advance_pc = true;
                        if (ctl & 1) == 0 || (ctl & 2) != 0 {
                            COUNT_EXIT_WFE_INDEFINITE.count();
                            VcpuExit::WaitForEvent
                        } else {
                            let deadline =
                                self.read_sys_reg(hv_sys_reg_t_HV_SYS_REG_CNTV_CVAL_EL0)?;
                            COUNT_EXIT_WFE_TIMED.count();
                            VcpuExit::WaitForEventDeadline(MachAbsoluteTime::from_raw(deadline))
                        }
                    }
                    _ => return Err(Error::UnsupportedException(ec as u8)),
                }
            }
            hv_exit_reason_t_HV_EXIT_REASON_VTIMER_ACTIVATED => {
                COUNT_EXIT_VTIMER.count();
                VcpuExit::VtimerActivated
            }
            reason => {
                let pc = self.read_raw_reg(hv_reg_t_HV_REG_PC)?;
                panic!(
                    "unexpected exit reason: vcpuid={} 0x{:x} at pc=0x{:x}",
                    self.id(),
                    reason,
                    pc
                );
            }
        };

        Ok(exit)
    }

    pub fn clear_pending_mmio(&mut self) {
        self.pending_mmio_read = None;
        self.pending_advance_pc = false;
    }

    /// Dispatches a hypercall exception. Implements the PSCI function IDs a
    /// Linux guest issues over its lifetime (version query, power off/reset,
    /// secondary core bringup, suspend, affinity/migrate-info queries) per
    /// the SMC Calling Convention: result goes back in X0, fast calls return
    /// immediately without advancing to a guest-visible trap.
    fn handle_hvc(&mut self) -> Result<VcpuExit, Error> {
        let val = self.read_raw_reg(hv_reg_t_HV_REG_X0)?;
        COUNT_EXIT_HVC.count();
        debug!("HVC: 0x{:x}", val);

        let ret: i64 = match val as u32 {
            PSCI_VERSION => PSCI_VERSION_1_1 as i64,
            PSCI_MIGRATE_INFO_TYPE => 2, // migration not supported
            PSCI_SYSTEM_OFF | PSCI_SYSTEM_RESET => return Ok(VcpuExit::Shutdown),
            PSCI_CPU_OFF => return Ok(VcpuExit::CpuOff),

            PSCI_CPU_ON => {
                let mpidr = self.read_raw_reg(hv_reg_t_HV_REG_X1)?;
                let entry = self.read_raw_reg(hv_reg_t_HV_REG_X2)?;
                let context_id = self.read_raw_reg(hv_reg_t_HV_REG_X3)?;
                self.write_raw_reg(hv_reg_t_HV_REG_X0, PSCI_SUCCESS as u64)?;
                return Ok(VcpuExit::CpuOn(mpidr, entry, context_id));
            }

            PSCI_CPU_SUSPEND => PSCI_SUCCESS,
            PSCI_AFFINITY_INFO => 0, // ON
            PSCI_FEATURES => PSCI_DISABLED,

            _ => {
                debug!("unhandled HVC: 0x{:x}", val);
                PSCI_NOT_SUPPORTED
            }
        };

        self.write_raw_reg(hv_reg_t_HV_REG_X0, ret as u64)?;
        Ok(VcpuExit::HypervisorCall)
    }

    pub fn dump_debug(&self) -> anyhow::Result<String> {
        use std::fmt::Write;

        let mut buf = String::new();

        writeln!(buf, "------ vCPU {} ------", self.id())?;
        writeln!(
            buf,
            "PC: 0x{:016x}  LR: 0x{:016x}  FP: 0x{:016x}",
            self.read_raw_reg(hv_reg_t_HV_REG_PC)?,
            self.read_raw_reg(hv_reg_t_HV_REG_LR)?,
            self.read_raw_reg(hv_reg_t_HV_REG_FP)?
        )?;
        let cpsr_mode = self.read_raw_reg(hv_reg_t_HV_REG_CPSR)? & PSR_MODE_MASK;
        let el_str = match cpsr_mode {
            PSR_MODE_EL0T => "EL0t",
            PSR_MODE_EL1T => "EL1t",
            PSR_MODE_EL1H => "EL1h",
            _ => "unknown",
        };
        writeln!(
            buf,
            "SP_EL1: 0x{:016x}  TPIDR_EL1: 0x{:016x}  VBAR_EL1: 0x{:016x}",
            self.read_sys_reg(hv_sys_reg_t_HV_SYS_REG_SP_EL1)?,
            self.read_sys_reg(hv_sys_reg_t_HV_SYS_REG_TPIDR_EL1)?,
            self.read_sys_reg(hv_sys_reg_t_HV_SYS_REG_VBAR_EL1)?,
        )?;
        writeln!(buf, "PSTATE(el): {}", el_str)?;

        if matches!(cpsr_mode, PSR_MODE_EL1T | PSR_MODE_EL1H) {
            writeln!(buf, "Registers:")?;
            for i in 0..32 {
                write!(
                    buf,
                    "x{:<2}: 0x{:016x}  ",
                    i,
                    self.read_raw_reg(hv_reg_t_HV_REG_X0 + i)?
                )?;
                if (i + 1) % 3 == 0 {
                    writeln!(buf)?;
                }
            }
            writeln!(buf)?;
        }

        Ok(buf)
    }

    pub fn destroy(self) {
        let err = unsafe { hv_vcpu_destroy(self.hv_vcpu.0) };
        if err != 0 {
            tracing::error!("failed to destroy vcpu: {err}");
        }
    }

    pub fn request_exit(hv_vcpu: HvVcpuRef) -> Result<(), Error> {
        let mut vcpu: hv_vcpu_t = hv_vcpu.0;
        let ret = unsafe { hv_vcpus_exit(&mut vcpu, 1) };
        HvfError::result(ret).map_err(Error::VcpuRequestExit)
    }

    pub fn set_pending_irq(
        hv_vcpu: HvVcpuRef,
        type_: InterruptType,
        pending: bool,
    ) -> Result<(), Error> {
        let ret = unsafe { hv_vcpu_set_pending_interrupt(hv_vcpu.0, type_ as u32, pending) };
        HvfError::result(ret).map_err(Error::VcpuSetPendingIrq)
    }

    pub fn set_vtimer_mask(hv_vcpu: HvVcpuRef, masked: bool) -> Result<(), Error> {
        let ret = unsafe { hv_vcpu_set_vtimer_mask(hv_vcpu.0, masked) };
        HvfError::result(ret).map_err(Error::VcpuSetVtimerMask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ec_constants_match_arm_architecture_reference() {
        assert_eq!(EC_AA64_HVC, 0x16);
        assert_eq!(EC_AA64_SMC, 0x17);
        assert_eq!(EC_SYSTEMREGISTERTRAP, 0x18);
        assert_eq!(EC_DATAABORT, 0x24);
    }
}
