mod shutdown;
mod signals;
mod startup;
mod util;

pub use shutdown::*;
pub use signals::*;
pub use startup::*;
