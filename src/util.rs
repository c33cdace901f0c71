// Re-export from common crate to keep crate::util::* paths stable
pub use telemux_common::config;
pub use telemux_common::paths;
pub mod logging;
pub mod run_id;
