use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{Result, StackError, StoreError};

/// Stack construction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Stack name, used in lane names and log output
    pub name: String,

    /// Whether a background root layer sits between the main context and
    /// the stores. Without it the main context writes to stores directly.
    pub root_layer: bool,

    /// Capacity of the commit-notification broadcast channel
    pub notice_capacity: usize,
}

impl StackConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Set the stack name
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Drop the root layer; the main context becomes top of chain
    pub fn without_root_layer(mut self) -> Self {
        self.root_layer = false;
        self
    }

    /// Set the commit-notification channel capacity
    pub fn notice_capacity(mut self, capacity: usize) -> Self {
        self.notice_capacity = capacity;
        self
    }

    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(StoreError::from)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|err| StackError::Configuration(format!("invalid stack config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StackError::Configuration(
                "stack name cannot be empty".to_string(),
            ));
        }
        if self.notice_capacity == 0 {
            return Err(StackError::Configuration(
                "notice_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            name: "datastack".to_string(),
            root_layer: true,
            notice_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StackConfig::default();
        assert_eq!(config.name, "datastack");
        assert!(config.root_layer);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = StackConfig::new("app").without_root_layer().notice_capacity(8);
        assert_eq!(config.name, "app");
        assert!(!config.root_layer);
        assert_eq!(config.notice_capacity, 8);
    }

    #[test]
    fn test_rejects_empty_name() {
        let config = StackConfig::new("");
        assert!(matches!(
            config.validate(),
            Err(StackError::Configuration(_))
        ));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.json");
        std::fs::write(&path, r#"{"name": "loaded", "root_layer": false}"#).unwrap();

        let config = StackConfig::from_json_file(&path).unwrap();
        assert_eq!(config.name, "loaded");
        assert!(!config.root_layer);
        // Unlisted fields fall back to defaults.
        assert_eq!(config.notice_capacity, 64);
    }
}
