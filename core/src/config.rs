use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SpyError};
use crate::log::LogConfig;

/// Top-level imagespy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpyConfig {
    /// Registry connection settings
    pub registry: RegistryConfig,

    /// Re-scrape scheduler settings
    pub updater: UpdaterConfig,

    /// Persistent store settings
    pub store: StoreConfig,

    /// Logging
    pub log: LogConfig,
}

impl SpyConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SpyError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: SpyConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.updater.worker_count == 0 {
            return Err(SpyError::Config(
                "updater.worker_count must be at least 1".to_string(),
            ));
        }
        if self.registry.address.trim().is_empty() {
            return Err(SpyError::Config(
                "registry.address must not be empty".to_string(),
            ));
        }
        if self.updater.event_capacity == 0 {
            return Err(SpyError::Config(
                "updater.event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Registry connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Default registry host for references without one
    pub address: String,

    /// Talk plain HTTP instead of HTTPS
    pub insecure: bool,

    /// Username (optional, falls back to REGISTRY_USERNAME)
    pub username: Option<String>,

    /// Password (optional, falls back to REGISTRY_PASSWORD)
    pub password: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: "docker.io".to_string(),
            insecure: false,
            username: None,
            password: None,
        }
    }
}

impl RegistryConfig {
    /// Resolve credentials, preferring configured values over the environment.
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = self
            .username
            .clone()
            .or_else(|| std::env::var("REGISTRY_USERNAME").ok());
        let password = self
            .password
            .clone()
            .or_else(|| std::env::var("REGISTRY_PASSWORD").ok());

        match (username, password) {
            (Some(u), Some(p)) => Some((u, p)),
            _ => None,
        }
    }
}

/// Re-scrape scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Number of repository groups scraped concurrently
    pub worker_count: usize,

    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            event_capacity: 256,
        }
    }
}

/// Persistent store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON snapshot file. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogFormat;

    #[test]
    fn test_defaults() {
        let config = SpyConfig::default();
        assert_eq!(config.registry.address, "docker.io");
        assert!(!config.registry.insecure);
        assert_eq!(config.updater.worker_count, 1);
        assert!(config.store.path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = SpyConfig::from_yaml(
            r#"
registry:
  address: registry.local:5000
  insecure: true
updater:
  worker_count: 4
log:
  format: json
"#,
        )
        .unwrap();
        assert_eq!(config.registry.address, "registry.local:5000");
        assert!(config.registry.insecure);
        assert_eq!(config.updater.worker_count, 4);
        assert_eq!(config.updater.event_capacity, 256);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = SpyConfig::from_yaml("updater:\n  worker_count: 0\n").unwrap_err();
        assert!(matches!(err, SpyError::Config(_)));
        assert!(err.to_string().contains("worker_count"));
    }

    #[test]
    fn test_empty_registry_rejected() {
        let mut config = SpyConfig::default();
        config.registry.address = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imagespy.yaml");
        std::fs::write(&path, "store:\n  path: /var/lib/imagespy/store.json\n").unwrap();

        let config = SpyConfig::from_file(&path).unwrap();
        assert_eq!(
            config.store.path,
            Some(PathBuf::from("/var/lib/imagespy/store.json"))
        );
    }

    #[test]
    fn test_from_missing_file() {
        let err = SpyConfig::from_file("/nonexistent/imagespy.yaml").unwrap_err();
        assert!(matches!(err, SpyError::Config(_)));
    }

    #[test]
    fn test_configured_credentials_win() {
        let config = RegistryConfig {
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.credentials(),
            Some(("user".to_string(), "pass".to_string()))
        );
    }
}
