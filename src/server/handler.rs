//! Table server handler contract.
//!
//! A handler owns the merge policy for parameter values. The table server
//! invokes it from the process loop only, one request at a time.

use crate::core::{Error, Result};
use crate::net::ParamValue;
use crate::server::config::TableServerConfig;

/// Request handler bound to a table server.
pub trait TableServerHandler: Send {
    /// Handler identifier.
    fn name(&self) -> &str;

    /// Configure the handler before any request is served.
    fn setup(&mut self, config: &TableServerConfig) -> Result<()>;

    /// Initialise `target` for a key seen for the first time.
    fn put(&mut self, key: &str, target: &mut ParamValue, incoming: &ParamValue) -> bool;

    /// Produce the value returned to a reader.
    fn get(&mut self, key: &str, stored: &ParamValue, out: &mut ParamValue) -> bool;

    /// Merge an incoming update into a stored value.
    fn update(&mut self, target: &mut ParamValue, incoming: &ParamValue) -> bool;

    /// Whether the value should be checkpointed now.
    fn checkpoint_now(&self, _key: &str, _value: &ParamValue) -> bool {
        false
    }
}

/// Version-driven checkpoint schedule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckpointPolicy {
    pub after: u64,
    pub frequency: u64,
}

impl CheckpointPolicy {
    pub fn from_config(config: &TableServerConfig) -> Self {
        Self {
            after: config.checkpoint_after,
            frequency: config.checkpoint_frequency,
        }
    }

    /// Due at `after`, then every `frequency` versions.
    pub fn is_due(&self, version: u64) -> bool {
        self.frequency > 0 && version >= self.after && (version - self.after) % self.frequency == 0
    }
}

/// Stores the first put and adds every update elementwise, scaled by the
/// `scale` parameter.
#[derive(Debug)]
pub struct AccumulateHandler {
    scale: f32,
    checkpoints: CheckpointPolicy,
}

impl AccumulateHandler {
    pub fn new() -> Self {
        Self {
            scale: 1.0,
            checkpoints: CheckpointPolicy::default(),
        }
    }
}

impl Default for AccumulateHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl TableServerHandler for AccumulateHandler {
    fn name(&self) -> &str {
        "accumulate"
    }

    fn setup(&mut self, config: &TableServerConfig) -> Result<()> {
        self.scale = config.param("scale", 1.0) as f32;
        self.checkpoints = CheckpointPolicy::from_config(config);
        Ok(())
    }

    fn put(&mut self, _key: &str, target: &mut ParamValue, incoming: &ParamValue) -> bool {
        *target = ParamValue::new(incoming.data.clone());
        true
    }

    fn get(&mut self, _key: &str, stored: &ParamValue, out: &mut ParamValue) -> bool {
        out.clone_from(stored);
        true
    }

    fn update(&mut self, target: &mut ParamValue, incoming: &ParamValue) -> bool {
        if target.data.len() != incoming.data.len() {
            return false;
        }
        for (t, u) in target.data.iter_mut().zip(incoming.data.iter()) {
            *t += self.scale * u;
        }
        target.version += 1;
        true
    }

    fn checkpoint_now(&self, _key: &str, value: &ParamValue) -> bool {
        self.checkpoints.is_due(value.version)
    }
}

/// Stores the first put and replaces the value on every update.
#[derive(Debug, Default)]
pub struct OverwriteHandler {
    checkpoints: CheckpointPolicy,
}

impl TableServerHandler for OverwriteHandler {
    fn name(&self) -> &str {
        "overwrite"
    }

    fn setup(&mut self, config: &TableServerConfig) -> Result<()> {
        if config.params.contains_key("scale") {
            return Err(Error::InvalidConfig(
                "overwrite handler takes no scale parameter".to_string(),
            ));
        }
        self.checkpoints = CheckpointPolicy::from_config(config);
        Ok(())
    }

    fn put(&mut self, _key: &str, target: &mut ParamValue, incoming: &ParamValue) -> bool {
        *target = ParamValue::new(incoming.data.clone());
        true
    }

    fn get(&mut self, _key: &str, stored: &ParamValue, out: &mut ParamValue) -> bool {
        out.clone_from(stored);
        true
    }

    fn update(&mut self, target: &mut ParamValue, incoming: &ParamValue) -> bool {
        target.data.clone_from(&incoming.data);
        target.version += 1;
        true
    }

    fn checkpoint_now(&self, _key: &str, value: &ParamValue) -> bool {
        self.checkpoints.is_due(value.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_policy() {
        let policy = CheckpointPolicy {
            after: 10,
            frequency: 5,
        };
        assert!(!policy.is_due(5));
        assert!(policy.is_due(10));
        assert!(!policy.is_due(12));
        assert!(policy.is_due(15));

        assert!(!CheckpointPolicy::default().is_due(0));
    }

    #[test]
    fn test_accumulate_update() {
        let mut handler = AccumulateHandler::new();
        handler
            .setup(&TableServerConfig::default().with_param("scale", 0.5))
            .unwrap();

        let mut stored = ParamValue::default();
        assert!(handler.put("w", &mut stored, &ParamValue::new(vec![1.0, 2.0])));
        assert!(handler.update(&mut stored, &ParamValue::new(vec![2.0, 4.0])));
        assert_eq!(stored.data, vec![2.0, 4.0]);
        assert_eq!(stored.version, 1);

        let mut out = ParamValue::default();
        assert!(handler.get("w", &stored, &mut out));
        assert_eq!(out, stored);
    }

    #[test]
    fn test_accumulate_rejects_shape_mismatch() {
        let mut handler = AccumulateHandler::new();
        let mut stored = ParamValue::new(vec![0.0; 3]);
        assert!(!handler.update(&mut stored, &ParamValue::new(vec![1.0])));
        assert_eq!(stored.version, 0);
    }

    #[test]
    fn test_overwrite_update() {
        let mut handler = OverwriteHandler::default();
        let mut stored = ParamValue::new(vec![1.0]);
        assert!(handler.update(&mut stored, &ParamValue::new(vec![7.0, 8.0])));
        assert_eq!(stored.data, vec![7.0, 8.0]);
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn test_overwrite_rejects_scale() {
        let mut handler = OverwriteHandler::default();
        let config = TableServerConfig::with_handler("overwrite").with_param("scale", 2.0);
        assert!(handler.setup(&config).is_err());
    }

    #[test]
    fn test_checkpoint_through_handler() {
        let mut handler = AccumulateHandler::new();
        handler
            .setup(&TableServerConfig::default().with_checkpoints(2, 2))
            .unwrap();
        let mut value = ParamValue::new(vec![0.0]);
        value.version = 4;
        assert!(handler.checkpoint_now("w", &value));
        value.version = 5;
        assert!(!handler.checkpoint_now("w", &value));
    }
}
