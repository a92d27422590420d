pub mod eventfd;
pub mod mach_time;
