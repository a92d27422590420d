use dlopen::wrapper::{Container, WrapperApi};
use dlopen_derive::WrapperApi;
use once_cell::sync::Lazy;

use super::bindings::{hv_gic_config_t, hv_ipa_t, hv_return_t, hv_vm_config_t};

/// macOS 12+ APIs (`hv_vm_config_*`).
pub static OPTIONAL12: Lazy<Option<Container<HvfOptional12>>> =
    Lazy::new(|| unsafe { Container::load_self() }.ok());

/// macOS 15+ APIs (`hv_gic_*`) — the host's built-in interrupt controller.
pub static OPTIONAL15: Lazy<Option<Container<HvfOptional15>>> =
    Lazy::new(|| unsafe { Container::load_self() }.ok());

#[derive(WrapperApi)]
pub struct HvfOptional12 {
    hv_vm_config_create: unsafe extern "C" fn() -> hv_vm_config_t,
    hv_vm_config_get_max_ipa_size: unsafe extern "C" fn(ipa_bit_length: *mut u32) -> hv_return_t,
    hv_vm_config_get_default_ipa_size:
        unsafe extern "C" fn(ipa_bit_length: *mut u32) -> hv_return_t,
    hv_vm_config_set_ipa_size:
        unsafe extern "C" fn(config: hv_vm_config_t, ipa_bit_length: u32) -> hv_return_t,
}

#[derive(WrapperApi)]
pub struct HvfOptional15 {
    hv_gic_config_create: unsafe extern "C" fn() -> hv_gic_config_t,
    hv_gic_get_distributor_size: unsafe extern "C" fn(distributor_size: *mut usize) -> hv_return_t,
    hv_gic_get_redistributor_region_size:
        unsafe extern "C" fn(redistributor_region_size: *mut usize) -> hv_return_t,
    hv_gic_config_set_distributor_base: unsafe extern "C" fn(
        config: hv_gic_config_t,
        distributor_base_address: hv_ipa_t,
    ) -> hv_return_t,
    hv_gic_config_set_redistributor_base: unsafe extern "C" fn(
        config: hv_gic_config_t,
        redistributor_base_address: hv_ipa_t,
    ) -> hv_return_t,
    hv_gic_create: unsafe extern "C" fn(config: hv_gic_config_t) -> hv_return_t,
    hv_gic_set_spi: unsafe extern "C" fn(intid: u32, level: bool) -> hv_return_t,
}

#[macro_export]
macro_rules! call_optional {
    ($optional:ident.$method:ident($($args: expr),*)) => {
        $optional.as_ref().unwrap().$method($($args),*)
    };
}

/// True when the host exposes the real hardware GIC config API; on hosts
/// without it `signal_spi` falls back to per-vCPU pending-interrupt injection.
pub fn native_gic_available() -> bool {
    OPTIONAL15.is_some()
}
