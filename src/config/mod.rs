//! Configuration management for workcache

pub mod schema;

pub use schema::{CacheSettings, CleanupSettings, LoggingSettings, Settings};

use crate::error::{CacheError, CacheResult};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct SettingsManager {
    config_path: PathBuf,
}

impl SettingsManager {
    /// Create a new settings manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a settings manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("workcache")
            .join("config.toml")
    }

    /// Get the default cache root
    pub fn default_cache_root() -> PathBuf {
        dirs::cache_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("workcache")
    }

    /// Load configuration, using defaults if the file does not exist
    pub async fn load(&self) -> CacheResult<Settings> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Settings::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> CacheResult<Settings> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| CacheError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| CacheError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, settings: &Settings) -> CacheResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                CacheError::io(format!("creating config directory {}", parent.display()), e)
            })?;
        }

        let content = toml::to_string_pretty(settings)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            CacheError::io(format!("writing config to {}", self.config_path.display()), e)
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for SettingsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheSettings {
    /// Resolved cache root
    pub fn root_dir(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(SettingsManager::default_cache_root)
    }

    /// Lock timeout as a duration
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Lock poll interval as a duration
    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_millis.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_default_when_missing() {
        let temp = TempDir::new().unwrap();
        let manager = SettingsManager::with_path(temp.path().join("nonexistent.toml"));

        let settings = manager.load().await.unwrap();
        assert_eq!(settings.cache.lock_timeout_secs, 60);
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let manager = SettingsManager::with_path(temp.path().join("nested").join("config.toml"));

        let mut settings = Settings::default();
        settings.cache.root = Some(temp.path().join("cache"));
        settings.cleanup.max_age_days = 3;

        manager.save(&settings).await.unwrap();
        let loaded = manager.load().await.unwrap();

        assert_eq!(loaded.cache.root_dir(), temp.path().join("cache"));
        assert_eq!(loaded.cleanup.max_age_days, 3);
    }

    #[tokio::test]
    async fn invalid_toml_is_config_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        tokio::fs::write(&path, "[cache\nroot = ").await.unwrap();

        let err = SettingsManager::with_path(path).load().await.unwrap_err();
        assert!(matches!(err, CacheError::ConfigInvalid { .. }));
    }

    #[test]
    fn lock_durations() {
        let settings = CacheSettings {
            lock_timeout_secs: 2,
            lock_poll_millis: 0,
            ..CacheSettings::default()
        };
        assert_eq!(settings.lock_timeout(), Duration::from_secs(2));
        assert_eq!(settings.lock_poll_interval(), Duration::from_millis(1));
    }
}
