//! Session manager configuration
//!
//! Read from an optional TOML file, then overridden by `KUBEDECK_*`
//! environment variables.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::fs;

pub const DEFAULT_MAX_INIT_ATTEMPTS: u32 = 3;
pub const DEFAULT_OBSERVER_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Failed backend initializations tolerated before giving up
    pub max_init_attempts: u32,
    /// Buffered events per output and lifecycle channel
    pub observer_capacity: usize,
    pub default_namespace: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_init_attempts: DEFAULT_MAX_INIT_ATTEMPTS,
            observer_capacity: DEFAULT_OBSERVER_CAPACITY,
            default_namespace: None,
        }
    }
}

impl ManagerConfig {
    /// Load from `path`, falling back to defaults when the file is absent
    pub async fn load(path: &Path) -> Result<Self> {
        let mut config = if fs::try_exists(path).await.unwrap_or(false) {
            let content = fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str::<ManagerConfig>(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            tracing::debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        config.merge_env_vars();
        config.validate()?;
        Ok(config)
    }

    pub fn merge_env_vars(&mut self) {
        self.merge_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`. Unparseable numbers are ignored.
    pub fn merge_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(attempts) = lookup("KUBEDECK_MAX_INIT_ATTEMPTS") {
            match attempts.parse::<u32>() {
                Ok(value) => self.max_init_attempts = value,
                Err(_) => tracing::warn!("Ignoring invalid KUBEDECK_MAX_INIT_ATTEMPTS: {attempts}"),
            }
        }

        if let Some(capacity) = lookup("KUBEDECK_OBSERVER_CAPACITY") {
            match capacity.parse::<usize>() {
                Ok(value) => self.observer_capacity = value,
                Err(_) => tracing::warn!("Ignoring invalid KUBEDECK_OBSERVER_CAPACITY: {capacity}"),
            }
        }

        if let Some(namespace) = lookup("KUBEDECK_NAMESPACE") {
            if !namespace.trim().is_empty() {
                self.default_namespace = Some(namespace);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_init_attempts == 0 {
            bail!("max_init_attempts must be at least 1");
        }
        if self.observer_capacity == 0 {
            bail!("observer_capacity must be at least 1");
        }
        if let Some(namespace) = &self.default_namespace {
            if namespace.trim().is_empty() {
                bail!("default_namespace must not be empty");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let mut config = ManagerConfig::default();
        config.merge_env_with(|_| None);
        assert_eq!(config.max_init_attempts, 3);
        assert_eq!(config.observer_capacity, 1000);

        let loaded = ManagerConfig::load(&dir.path().join("absent.toml")).await;
        assert!(loaded.is_ok());
    }

    #[tokio::test]
    async fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kubedeck.toml");
        tokio::fs::write(&path, "max_init_attempts = 5\ndefault_namespace = \"staging\"\n")
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let config: ManagerConfig = toml::from_str(&content).unwrap();
        assert_eq!(config.max_init_attempts, 5);
        assert_eq!(config.observer_capacity, DEFAULT_OBSERVER_CAPACITY);
        assert_eq!(config.default_namespace.as_deref(), Some("staging"));
    }

    #[tokio::test]
    async fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kubedeck.toml");
        tokio::fs::write(&path, "max_init_attempts = \"many\"").await.unwrap();

        let err = ManagerConfig::load(&path).await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("KUBEDECK_MAX_INIT_ATTEMPTS", "7"),
            ("KUBEDECK_OBSERVER_CAPACITY", "not-a-number"),
            ("KUBEDECK_NAMESPACE", "monitoring"),
        ]);
        let mut config = ManagerConfig::default();
        config.merge_env_with(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.max_init_attempts, 7);
        assert_eq!(config.observer_capacity, DEFAULT_OBSERVER_CAPACITY);
        assert_eq!(config.default_namespace.as_deref(), Some("monitoring"));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = ManagerConfig {
            max_init_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ManagerConfig {
            observer_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(ManagerConfig::default().validate().is_ok());
    }
}
