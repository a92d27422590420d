pub mod gic;

pub use gic::Gic;
