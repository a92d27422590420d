//! Hand-vendored declarations for the subset of Hypervisor.framework's
//! aarch64 C API this crate calls. There is no safe (or unsafe-but-complete)
//! crate for these on crates.io, so, like the rest of the HVF ecosystem, we
//! declare the bits we need directly against Apple's public headers
//! (`Hypervisor/hv_vcpu.h`, `hv_vm.h`, `hv_gic.h`, `hv_types.h`).
#![allow(non_camel_case_types, non_upper_case_globals, dead_code)]

use std::ffi::{c_char, c_void};

pub type hv_return_t = i32;
pub const HV_SUCCESS: hv_return_t = 0;
pub const HV_ERROR: hv_return_t = -1;
pub const HV_BUSY: hv_return_t = -2;
pub const HV_BAD_ARGUMENT: hv_return_t = -3;
pub const HV_ILLEGAL_GUEST_STATE: hv_return_t = -4;
pub const HV_NO_RESOURCES: hv_return_t = -5;
pub const HV_NO_DEVICE: hv_return_t = -6;
pub const HV_DENIED: hv_return_t = -7;
pub const HV_UNSUPPORTED: hv_return_t = -8;

pub type hv_vcpu_t = u64;
pub type hv_vm_config_t = *mut c_void;
pub type hv_gic_config_t = *mut c_void;
pub type hv_ipa_t = u64;

pub type hv_memory_flags_t = u64;
pub const HV_MEMORY_READ: hv_memory_flags_t = 1 << 0;
pub const HV_MEMORY_WRITE: hv_memory_flags_t = 1 << 1;
pub const HV_MEMORY_EXEC: hv_memory_flags_t = 1 << 2;

pub type hv_reg_t = u32;
pub const hv_reg_t_HV_REG_X0: hv_reg_t = 0;
pub const hv_reg_t_HV_REG_X1: hv_reg_t = 1;
pub const hv_reg_t_HV_REG_X2: hv_reg_t = 2;
pub const hv_reg_t_HV_REG_X3: hv_reg_t = 3;
pub const hv_reg_t_HV_REG_FP: hv_reg_t = 29;
pub const hv_reg_t_HV_REG_LR: hv_reg_t = 30;
pub const hv_reg_t_HV_REG_PC: hv_reg_t = 31;
pub const hv_reg_t_HV_REG_CPSR: hv_reg_t = 33;

pub fn hv_reg_for_gp_index(idx: u32) -> hv_reg_t {
    // HV_REG_X0..X30 are numbered sequentially; X31 (XZR) has no backing register.
    idx
}

pub type hv_sys_reg_t = u16;
pub const hv_sys_reg_t_HV_SYS_REG_SCTLR_EL1: hv_sys_reg_t = 0xc002;
pub const hv_sys_reg_t_HV_SYS_REG_TCR_EL1: hv_sys_reg_t = 0xc102;
pub const hv_sys_reg_t_HV_SYS_REG_TTBR1_EL1: hv_sys_reg_t = 0xc101;
pub const hv_sys_reg_t_HV_SYS_REG_VBAR_EL1: hv_sys_reg_t = 0xc600;
pub const hv_sys_reg_t_HV_SYS_REG_SP_EL1: hv_sys_reg_t = 0xc208;
pub const hv_sys_reg_t_HV_SYS_REG_TPIDR_EL1: hv_sys_reg_t = 0xc684;
pub const hv_sys_reg_t_HV_SYS_REG_CONTEXTIDR_EL1: hv_sys_reg_t = 0xc101;
pub const hv_sys_reg_t_HV_SYS_REG_MPIDR_EL1: hv_sys_reg_t = 0xc005;
pub const hv_sys_reg_t_HV_SYS_REG_ID_AA64MMFR0_EL1: hv_sys_reg_t = 0xc020;
pub const hv_sys_reg_t_HV_SYS_REG_CNTV_CTL_EL0: hv_sys_reg_t = 0xdf19;
pub const hv_sys_reg_t_HV_SYS_REG_CNTV_CVAL_EL0: hv_sys_reg_t = 0xdf1a;

pub type hv_interrupt_type_t = u32;
pub const hv_interrupt_type_t_HV_INTERRUPT_TYPE_IRQ: hv_interrupt_type_t = 0;
pub const hv_interrupt_type_t_HV_INTERRUPT_TYPE_FIQ: hv_interrupt_type_t = 1;

pub type hv_exit_reason_t = u32;
pub const hv_exit_reason_t_HV_EXIT_REASON_CANCELED: hv_exit_reason_t = 0;
pub const hv_exit_reason_t_HV_EXIT_REASON_EXCEPTION: hv_exit_reason_t = 1;
pub const hv_exit_reason_t_HV_EXIT_REASON_VTIMER_ACTIVATED: hv_exit_reason_t = 2;
pub const hv_exit_reason_t_HV_EXIT_REASON_UNKNOWN: hv_exit_reason_t = 3;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct hv_vcpu_exit_exception_t {
    pub syndrome: u64,
    pub virtual_address: u64,
    pub physical_address: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct hv_vcpu_exit_t {
    pub reason: hv_exit_reason_t,
    pub exception: hv_vcpu_exit_exception_t,
}

pub type hv_gic_intid_t = u32;
pub const hv_gic_intid_t_HV_GIC_INT_MAINTENANCE: hv_gic_intid_t = 0;

extern "C" {
    pub fn hv_vm_create(config: hv_vm_config_t) -> hv_return_t;
    pub fn hv_vm_destroy() -> hv_return_t;
    pub fn hv_vm_map(addr: *mut c_void, ipa: hv_ipa_t, size: usize, flags: hv_memory_flags_t) -> hv_return_t;
    pub fn hv_vm_unmap(ipa: hv_ipa_t, size: usize) -> hv_return_t;
    pub fn hv_vm_protect(ipa: hv_ipa_t, size: usize, flags: hv_memory_flags_t) -> hv_return_t;

    pub fn hv_vcpu_create(
        vcpu: *mut hv_vcpu_t,
        exit: *mut *mut hv_vcpu_exit_t,
        config: hv_vm_config_t,
    ) -> hv_return_t;
    pub fn hv_vcpu_destroy(vcpu: hv_vcpu_t) -> hv_return_t;
    pub fn hv_vcpu_run(vcpu: hv_vcpu_t) -> hv_return_t;
    pub fn hv_vcpus_exit(vcpus: *mut hv_vcpu_t, vcpu_count: u32) -> hv_return_t;
    pub fn hv_vcpu_get_reg(vcpu: hv_vcpu_t, reg: hv_reg_t, value: *mut u64) -> hv_return_t;
    pub fn hv_vcpu_set_reg(vcpu: hv_vcpu_t, reg: hv_reg_t, value: u64) -> hv_return_t;
    pub fn hv_vcpu_get_sys_reg(vcpu: hv_vcpu_t, reg: hv_sys_reg_t, value: *mut u64) -> hv_return_t;
    pub fn hv_vcpu_set_sys_reg(vcpu: hv_vcpu_t, reg: hv_sys_reg_t, value: u64) -> hv_return_t;
    pub fn hv_vcpu_set_vtimer_mask(vcpu: hv_vcpu_t, masked: bool) -> hv_return_t;
    pub fn hv_vcpu_set_pending_interrupt(
        vcpu: hv_vcpu_t,
        interrupt_type: hv_interrupt_type_t,
        pending: bool,
    ) -> hv_return_t;

    pub fn os_release(object: *mut c_void);
}

// hv_vm_config_* and hv_gic_* only exist on macOS 12+/15+ respectively, so they are
// resolved at runtime through `weak_link` (dlopen against the running process) instead
// of being declared here as hard link-time symbols.

#[allow(unused)]
pub type hv_unused_char = c_char;
