#[allow(non_camel_case_types)]
#[allow(improper_ctypes)]
#[allow(dead_code)]
#[allow(non_snake_case)]
#[allow(non_upper_case_globals)]
#[allow(deref_nullptr)]
mod bindings;

mod error;
mod vcpu;
mod vm;
mod vm_config;
mod weak_link;

pub use error::*;
pub use vcpu::*;
pub use vm::*;
