//! Network engine configuration.

use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable whose presence marks a process launched by the
/// collective runtime.
pub const DEFAULT_ACTIVATION_ENV: &str = "OMPI_COMM_WORLD_RANK";

/// Request scheduling discipline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Strict per-key FIFO with round-robin across keys
    #[default]
    Sync,
    /// Put/get phase batching bounded by the memory server count
    Async,
}

impl std::fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateMode::Sync => write!(f, "sync"),
            UpdateMode::Async => write!(f, "async"),
        }
    }
}

/// Engine configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pause between polls when no work is found, in microseconds
    pub sleep_time_us: u64,
    /// Scheduling discipline for incoming requests
    pub update_mode: UpdateMode,
    /// Number of memory-server peers issuing requests per key
    pub num_memory_servers: usize,
    /// Flip a key to get-serving after its very first put
    pub first_put_flips_phase: bool,
    /// Environment variable gating network activation
    pub activation_env: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sleep_time_us: 1000,
            update_mode: UpdateMode::Sync,
            num_memory_servers: 1,
            first_put_flips_phase: true,
            activation_env: DEFAULT_ACTIVATION_ENV.to_string(),
        }
    }
}

impl EngineConfig {
    /// Synchronous scheduling.
    pub fn sync() -> Self {
        Self::default()
    }

    /// Asynchronous scheduling for `num_memory_servers` peers.
    pub fn asynchronous(num_memory_servers: usize) -> Self {
        Self {
            update_mode: UpdateMode::Async,
            num_memory_servers,
            ..Default::default()
        }
    }

    /// Set the poll interval.
    pub fn with_sleep_time(mut self, sleep: Duration) -> Self {
        self.sleep_time_us = u64::try_from(sleep.as_micros()).unwrap_or(u64::MAX);
        self
    }

    pub fn sleep_time(&self) -> Duration {
        Duration::from_micros(self.sleep_time_us)
    }

    /// Parse from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sleep_time_us == 0 {
            return Err(Error::InvalidConfig(
                "sleep_time_us must be positive".to_string(),
            ));
        }
        if self.num_memory_servers == 0 {
            return Err(Error::InvalidConfig(
                "num_memory_servers must be at least 1".to_string(),
            ));
        }
        if self.activation_env.is_empty() {
            return Err(Error::InvalidConfig(
                "activation_env must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.sleep_time(), Duration::from_millis(1));
        assert_eq!(config.update_mode, UpdateMode::Sync);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            EngineConfig::from_json(r#"{"update_mode": "async", "num_memory_servers": 4}"#)
                .unwrap();
        assert_eq!(config.update_mode, UpdateMode::Async);
        assert_eq!(config.num_memory_servers, 4);
        assert_eq!(config.sleep_time_us, 1000);
        assert_eq!(config.activation_env, DEFAULT_ACTIVATION_ENV);
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        assert!(EngineConfig::from_json(r#"{"sleep_time_us": 0}"#).is_err());
        assert!(EngineConfig::from_json(r#"{"num_memory_servers": 0}"#).is_err());
    }

    #[test]
    fn test_builder_helpers() {
        let config = EngineConfig::asynchronous(3).with_sleep_time(Duration::from_micros(250));
        assert_eq!(config.update_mode, UpdateMode::Async);
        assert_eq!(config.num_memory_servers, 3);
        assert_eq!(config.sleep_time_us, 250);
    }
}
