use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::{parse_document, Config, ConfigError};

/// Serves a validated configuration and applies hot updates.
pub struct ConfigManager<T: Config> {
    config: ArcSwap<T>,
    path: Option<PathBuf>,
}

impl<T: Config> ConfigManager<T> {
    pub fn new(config: T) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            path: None,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = Self::read(path)?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(Self {
            config: ArcSwap::from_pointee(config),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self) -> arc_swap::Guard<Arc<T>> {
        self.config.load()
    }

    /// Replace the whole configuration after validating it.
    pub fn update(&self, new_config: T) -> Result<(), ConfigError> {
        new_config.validate()?;
        self.config.store(Arc::new(new_config));
        Ok(())
    }

    fn read(path: &Path) -> Result<T, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = T::from_toml(&parse_document(&content)?)?;
        config.validate()?;
        Ok(config)
    }
}

impl<T: Config + Clone> ConfigManager<T> {
    /// Re-read the backing file, applying only hot-updatable fields.
    /// Returns `false` when the manager has no backing file.
    pub fn reload(&self) -> Result<bool, ConfigError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(false);
        };
        let fresh = Self::read(path)?;
        let mut current = self.snapshot();
        current.hot_update(&fresh);
        current.validate()?;
        self.config.store(Arc::new(current));
        tracing::info!(path = %path.display(), "config reloaded");
        Ok(true)
    }

    pub fn snapshot(&self) -> T {
        (*self.config.load_full()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{from_toml_serde, render_serde};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PollConfig {
        #[serde(default = "default_batch")]
        batch: u32,
        #[serde(default)]
        label: String,
    }

    fn default_batch() -> u32 {
        16
    }

    impl Config for PollConfig {
        fn from_toml(value: &toml::Value) -> Result<Self, ConfigError> {
            from_toml_serde(value)
        }

        fn hot_update(&mut self, other: &Self) {
            self.batch = other.batch;
        }

        fn render(&self) -> String {
            render_serde(self)
        }

        fn validate(&self) -> Result<(), ConfigError> {
            if self.batch == 0 {
                return Err(ConfigError::out_of_range("batch", 0, Some(1), None::<u32>));
            }
            Ok(())
        }
    }

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "cbnet-config-{}-{}.toml",
            name,
            std::process::id()
        ));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_applies_defaults() {
        let path = temp_file("defaults", "label = \"a\"\n");
        let mgr = ConfigManager::<PollConfig>::load(&path).unwrap();
        assert_eq!(mgr.get().batch, 16);
        assert_eq!(mgr.get().label, "a");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_load_rejects_invalid() {
        let path = temp_file("invalid", "batch = 0\n");
        let err = ConfigManager::<PollConfig>::load(&path).err().unwrap();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_load_reports_type_errors() {
        let path = temp_file("types", "batch = \"many\"\n");
        assert!(matches!(
            ConfigManager::<PollConfig>::load(&path),
            Err(ConfigError::Parse(_))
        ));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_update_validates() {
        let mgr = ConfigManager::new(PollConfig {
            batch: 4,
            label: String::new(),
        });
        assert!(mgr
            .update(PollConfig {
                batch: 0,
                label: String::new()
            })
            .is_err());
        assert_eq!(mgr.get().batch, 4);
    }

    #[test]
    fn test_reload_only_hot_fields() {
        let path = temp_file("reload", "batch = 8\nlabel = \"first\"\n");
        let mgr = ConfigManager::<PollConfig>::load(&path).unwrap();
        std::fs::write(&path, "batch = 32\nlabel = \"second\"\n").unwrap();
        assert!(mgr.reload().unwrap());
        let cfg = mgr.snapshot();
        assert_eq!(cfg.batch, 32);
        assert_eq!(cfg.label, "first");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_reload_without_file() {
        let mgr = ConfigManager::new(PollConfig {
            batch: 1,
            label: String::new(),
        });
        assert!(!mgr.reload().unwrap());
    }

    #[test]
    fn test_render_roundtrip() {
        let cfg = PollConfig {
            batch: 7,
            label: "x".into(),
        };
        let parsed = PollConfig::from_toml(&parse_document(&cfg.render()).unwrap()).unwrap();
        assert_eq!(parsed, cfg);
    }
}
