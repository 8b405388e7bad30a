//! Configuration management for rcryptfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the key file created in the home directory
pub const DEFAULT_KEY_FILE_NAME: &str = ".rcryptfs.properties";

/// Scratch memory a session thread keeps between reads: 1MB
pub const DEFAULT_SCRATCH_RETAIN: usize = 1024 * 1024;

/// Attribute cache TTL handed to the kernel
pub const DEFAULT_ATTR_TTL_SECS: u64 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Plaintext directory exposed through the mount
    pub source_dir: PathBuf,

    /// Properties file holding the key and IV
    pub key_file: PathBuf,

    /// Mount configuration
    pub mount: MountConfig,

    /// Read path tuning
    pub read: ReadConfig,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,

    /// Extra `-o` options, forwarded verbatim to FUSE
    #[serde(default)]
    pub options: Vec<String>,

    /// Attribute/entry TTL in seconds
    pub attr_ttl_secs: u64,
}

/// Read path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadConfig {
    /// Largest scratch buffer a thread keeps after a read completes
    pub scratch_retain_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        Config {
            source_dir: home.join("tmp"),
            key_file: home.join(DEFAULT_KEY_FILE_NAME),
            mount: MountConfig::default(),
            read: ReadConfig::default(),
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/rcryptfs"),
            allow_other: false,
            auto_unmount: true,
            options: Vec::new(),
            attr_ttl_secs: DEFAULT_ATTR_TTL_SECS,
        }
    }
}

impl Default for ReadConfig {
    fn default() -> Self {
        ReadConfig {
            scratch_retain_bytes: DEFAULT_SCRATCH_RETAIN,
        }
    }
}

impl Config {
    /// Create a config for the given source tree and key file, defaults elsewhere
    pub fn new(source_dir: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Config {
            source_dir: source_dir.into(),
            key_file: key_file.into(),
            ..Config::default()
        }
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load the config file if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }

        let mut config = Config::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(source) = std::env::var("RCRYPTFS_SOURCE_DIR") {
            let source = source.trim();
            if !source.is_empty() {
                self.source_dir = PathBuf::from(source);
            }
        }

        if let Ok(key_file) = std::env::var("RCRYPTFS_KEY_FILE") {
            let key_file = key_file.trim();
            if !key_file.is_empty() {
                self.key_file = PathBuf::from(key_file);
            }
        }

        if let Ok(retain) = std::env::var("RCRYPTFS_SCRATCH_RETAIN") {
            if let Ok(size) = retain.trim().parse::<usize>() {
                self.read.scratch_retain_bytes = size;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.source_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "Source directory is required".to_string(),
            ));
        }

        if self.key_file.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("Key file path is required".to_string()));
        }

        if self.read.scratch_retain_bytes == 0 {
            return Err(Error::InvalidConfig(
                "Scratch retain size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::new(dir.path().join("plain"), dir.path().join("keys"));
        config.mount.options = vec!["noatime".to_string()];
        config.read.scratch_retain_bytes = 4096;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.source_dir, dir.path().join("plain"));
        assert_eq!(loaded.key_file, dir.path().join("keys"));
        assert_eq!(loaded.mount.options, vec!["noatime".to_string()]);
        assert_eq!(loaded.read.scratch_retain_bytes, 4096);
    }

    #[test]
    fn test_validate_rejects_zero_retain() {
        let mut config = Config::new("/src", "/keys");
        config.read.scratch_retain_bytes = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_empty_source() {
        let config = Config::new("", "/keys");
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_load_garbage_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.json")).unwrap();
        assert!(config.read.scratch_retain_bytes > 0);
    }
}
