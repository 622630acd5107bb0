//! Configuration management for the daemon.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default idle interval after which an unlocked keychain relocks (seconds).
pub const DEFAULT_KEYCHAIN_IDLE_LOCK_SECS: u64 = 600;

/// Idle interval after which the smartcard helper is reaped when no
/// readers are present (seconds).
pub const DEFAULT_HELPER_IDLE_SHUTDOWN_SECS: u64 = 120;

/// Default executable path of the smartcard helper daemon.
pub const HELPER_EXEC_PATH: &str = "/usr/sbin/pcscd";

/// Environment variable overriding the helper executable path.
pub const HELPER_PATH_ENV: &str = "PCSCDAEMON";

/// Working directory of the smartcard helper daemon.
pub const HELPER_WORKING_DIR: &str = "/var/run/pcscd";

/// Smartcard service policy: when the daemon launches the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLevel {
    /// Never touch smartcard hardware or the helper.
    ForcedOff,
    /// Launch the helper unconditionally at startup.
    ForcedOn,
    /// Someone else runs the helper; listen but never launch or reap.
    ExternalDaemon,
    /// Launch only for devices positively identified as card readers.
    Conservative,
    /// Launch for anything that might plausibly be a card reader.
    Aggressive,
}

impl Default for ServiceLevel {
    fn default() -> Self {
        ServiceLevel::Conservative
    }
}

/// Main daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Smartcard helper launch policy.
    #[serde(default)]
    pub service_level: ServiceLevel,
    /// Idle interval before an unlocked keychain relocks, in seconds.
    #[serde(default = "default_keychain_idle_lock")]
    pub keychain_idle_lock_secs: u64,
    /// Idle interval before the smartcard helper is reaped, in seconds.
    #[serde(default = "default_helper_idle_shutdown")]
    pub helper_idle_shutdown_secs: u64,
    /// Path of the smartcard helper executable.
    #[serde(default = "default_helper_path")]
    pub helper_path: String,
}

fn default_keychain_idle_lock() -> u64 {
    DEFAULT_KEYCHAIN_IDLE_LOCK_SECS
}

fn default_helper_idle_shutdown() -> u64 {
    DEFAULT_HELPER_IDLE_SHUTDOWN_SECS
}

fn default_helper_path() -> String {
    HELPER_EXEC_PATH.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            service_level: ServiceLevel::default(),
            keychain_idle_lock_secs: DEFAULT_KEYCHAIN_IDLE_LOCK_SECS,
            helper_idle_shutdown_secs: DEFAULT_HELPER_IDLE_SHUTDOWN_SECS,
            helper_path: HELPER_EXEC_PATH.to_string(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the config file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let config_path = paths.config_file();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("KEYWARDEN_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Ok(path) = std::env::var(HELPER_PATH_ENV) {
            if !path.trim().is_empty() {
                self.helper_path = path;
            }
        }
    }

    /// Parse a service level name as used in config files and launch args.
    pub fn parse_service_level(name: &str) -> CoreResult<ServiceLevel> {
        match name {
            "forced_off" => Ok(ServiceLevel::ForcedOff),
            "forced_on" => Ok(ServiceLevel::ForcedOn),
            "external_daemon" => Ok(ServiceLevel::ExternalDaemon),
            "conservative" => Ok(ServiceLevel::Conservative),
            "aggressive" => Ok(ServiceLevel::Aggressive),
            other => Err(CoreError::Config(format!(
                "unknown service level: {other}"
            ))),
        }
    }
}
