pub mod daemon;
pub mod util;

pub use telemux_storage as storage;
