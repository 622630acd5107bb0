//! File system paths for the daemon.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

/// Manages file system paths for the daemon.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory for daemon runtime files (~/.keywarden)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.keywarden`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;

        Ok(Self {
            base_dir: home.join(".keywarden"),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory (~/.keywarden).
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (~/.keywarden/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the request-port socket path (~/.keywarden/daemon.sock).
    pub fn socket_file(&self) -> PathBuf {
        self.base_dir.join("daemon.sock")
    }

    /// Get the PID file path (~/.keywarden/daemon.pid).
    pub fn pid_file(&self) -> PathBuf {
        self.base_dir.join("daemon.pid")
    }

    /// Ensure the base directory exists.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_with_base_dir() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        assert_eq!(paths.base_dir(), dir.path());
        assert_eq!(paths.config_file(), dir.path().join("config.json"));
        assert_eq!(paths.socket_file(), dir.path().join("daemon.sock"));
    }

    #[test]
    fn test_ensure_dirs() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().join("nested").join("base"));
        paths.ensure_dirs().unwrap();
        assert!(paths.base_dir().is_dir());
    }
}
