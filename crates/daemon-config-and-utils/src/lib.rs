//! Core types, configuration, and utilities for the Keywarden daemon.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    Config, ServiceLevel, DEFAULT_HELPER_IDLE_SHUTDOWN_SECS, DEFAULT_KEYCHAIN_IDLE_LOCK_SECS,
    DEFAULT_LOG_LEVEL, HELPER_EXEC_PATH, HELPER_PATH_ENV, HELPER_WORKING_DIR,
};
pub use error::{CoreError, CoreResult};
pub use logging::init_logging;
pub use paths::Paths;
