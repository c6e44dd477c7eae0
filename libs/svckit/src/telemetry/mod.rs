//! Logging setup and log-noise helpers.

pub mod init;
pub mod throttled_log;

pub use init::init_logging;
pub use throttled_log::ThrottledLog;
