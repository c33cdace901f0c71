pub mod cycle;
pub mod error;
pub mod frame;
pub mod records;
pub mod router;
pub mod snapshot;
