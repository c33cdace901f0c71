use once_cell::sync::OnceCell;
use std::fmt;

static RUN_ID: OnceCell<String> = OnceCell::new();

/// First call wins; the daemon sets it once at startup.
pub fn set_run_id(run_id: impl Into<String>) {
    let _ = RUN_ID.set(run_id.into());
}

pub fn run_id() -> Option<&'static str> {
    RUN_ID.get().map(String::as_str)
}

/// Line prefix naming the daemon run, `[-]` until one is set. Lets lines
/// from restarted daemons sharing a log directory be told apart.
#[derive(Debug, Clone, Copy)]
pub struct RunIdPrefix(pub Option<&'static str>);

impl RunIdPrefix {
    pub fn current() -> Self {
        Self(run_id())
    }
}

impl fmt::Display for RunIdPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.unwrap_or("-"))
    }
}

#[macro_export]
macro_rules! log_with_run_id {
    ($level:expr, $($arg:tt)+) => {
        log::log!(
            $level,
            "{} {}",
            $crate::util::logging::RunIdPrefix::current(),
            format_args!($($arg)+)
        )
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => { $crate::log_with_run_id!(log::Level::Error, $($arg)+) };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => { $crate::log_with_run_id!(log::Level::Warn, $($arg)+) };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => { $crate::log_with_run_id!(log::Level::Info, $($arg)+) };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => { $crate::log_with_run_id!(log::Level::Debug, $($arg)+) };
}

pub use crate::{debug, error, info, warn};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_names_the_run() {
        assert_eq!(RunIdPrefix(Some("q2xk9Z")).to_string(), "[q2xk9Z]");
        assert_eq!(RunIdPrefix(None).to_string(), "[-]");
    }

    #[test]
    fn macros_accept_format_arguments() {
        let cycle = 7;
        info!("cycle {} admitted", cycle);
        debug!("{cycle} with inline capture");
        warn!("plain");
    }
}
