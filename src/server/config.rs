//! Table server configuration.

use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration handed to the table server and its handler's `setup`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableServerConfig {
    /// Registry name of the handler to bind
    pub handler: String,
    /// Free-form numeric parameters for the handler
    pub params: HashMap<String, f64>,
    /// First value version at which checkpoints become due
    pub checkpoint_after: u64,
    /// Versions between checkpoints; 0 disables checkpointing
    pub checkpoint_frequency: u64,
}

impl Default for TableServerConfig {
    fn default() -> Self {
        Self {
            handler: "accumulate".to_string(),
            params: HashMap::new(),
            checkpoint_after: 0,
            checkpoint_frequency: 0,
        }
    }
}

impl TableServerConfig {
    /// Config selecting the named handler.
    pub fn with_handler(handler: &str) -> Self {
        Self {
            handler: handler.to_string(),
            ..Default::default()
        }
    }

    /// Set a handler parameter.
    pub fn with_param(mut self, name: &str, value: f64) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }

    /// Enable checkpointing.
    pub fn with_checkpoints(mut self, after: u64, frequency: u64) -> Self {
        self.checkpoint_after = after;
        self.checkpoint_frequency = frequency;
        self
    }

    /// A handler parameter, or `default` if unset.
    pub fn param(&self, name: &str, default: f64) -> f64 {
        self.params.get(name).copied().unwrap_or(default)
    }

    /// Parse from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.handler.is_empty() {
            return Err(Error::InvalidConfig("handler name must not be empty".to_string()));
        }
        if let Some((name, _)) = self.params.iter().find(|(_, v)| !v.is_finite()) {
            return Err(Error::InvalidConfig(format!("parameter '{}' is not finite", name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TableServerConfig::default();
        assert_eq!(config.handler, "accumulate");
        assert_eq!(config.checkpoint_frequency, 0);
        assert_eq!(config.param("scale", 1.0), 1.0);
    }

    #[test]
    fn test_from_json() {
        let config = TableServerConfig::from_json(
            r#"{"handler": "overwrite", "params": {"scale": 0.5}, "checkpoint_frequency": 10}"#,
        )
        .unwrap();
        assert_eq!(config.handler, "overwrite");
        assert_eq!(config.param("scale", 1.0), 0.5);
        assert_eq!(config.checkpoint_frequency, 10);
        assert_eq!(config.checkpoint_after, 0);
    }

    #[test]
    fn test_rejects_empty_handler() {
        assert!(TableServerConfig::from_json(r#"{"handler": ""}"#).is_err());
    }
}
