//! Configuration schema for workcache
//!
//! Configuration is stored at `~/.config/workcache/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Cache root and locking
    pub cache: CacheSettings,

    /// End-of-build cleanup policy
    pub cleanup: CleanupSettings,

    /// Logging
    pub logging: LoggingSettings,
}

/// Cache root settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Root directory; defaults to the platform cache dir
    pub root: Option<PathBuf>,

    /// How long to wait for a cache lock before giving up
    pub lock_timeout_secs: u64,

    /// Poll interval while waiting for a contended lock
    pub lock_poll_millis: u64,

    /// Version of the host tool writing into the cache
    pub producer_version: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            root: None,
            lock_timeout_secs: 60,
            lock_poll_millis: 50,
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Cleanup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupSettings {
    /// Run cleanup at the end of root builds
    pub enabled: bool,

    /// Minimum hours between two sweeps (0 = every build)
    pub interval_hours: u32,

    /// Remove workspaces not accessed for this many days (0 = never)
    pub max_age_days: u32,

    /// Forget tool versions not used for this many days
    pub version_retention_days: u32,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 24,
            max_age_days: 7,
            version_retention_days: 30,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level: "error", "warn", "info", "debug" or "trace"
    pub level: String,

    /// Log format: "text" or "json"
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let settings = Settings::default();
        assert!(settings.cache.root.is_none());
        assert_eq!(settings.cache.lock_timeout_secs, 60);
        assert!(settings.cleanup.enabled);
        assert_eq!(settings.cleanup.max_age_days, 7);
        assert_eq!(settings.logging.format, "text");
    }

    #[test]
    fn parse_partial_toml() {
        let toml_str = r#"
            [cache]
            root = "/var/cache/builds"

            [cleanup]
            interval_hours = 0
        "#;

        let settings: Settings = toml::from_str(toml_str).unwrap();
        assert_eq!(settings.cache.root, Some(PathBuf::from("/var/cache/builds")));
        assert_eq!(settings.cache.lock_timeout_secs, 60);
        assert_eq!(settings.cleanup.interval_hours, 0);
        assert_eq!(settings.cleanup.version_retention_days, 30);
    }

    #[test]
    fn serialize_roundtrip() {
        let mut settings = Settings::default();
        settings.logging.level = "debug".to_string();

        let toml_str = toml::to_string_pretty(&settings).unwrap();
        assert!(toml_str.contains("[cleanup]"));

        let parsed: Settings = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.logging.level, "debug");
    }
}
