//! Handler registry.
//!
//! Maps handler names to constructors. Populated explicitly at process
//! start, usually through [`HandlerRegistry::with_builtins`].

use crate::core::{Error, Result};
use crate::server::config::TableServerConfig;
use crate::server::handler::{AccumulateHandler, OverwriteHandler, TableServerHandler};
use std::collections::HashMap;

/// Constructor for a handler instance.
pub type HandlerConstructor = Box<dyn Fn() -> Box<dyn TableServerHandler> + Send + Sync>;

/// Registry of handler constructors keyed by name.
pub struct HandlerRegistry {
    constructors: HashMap<String, HandlerConstructor>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Create a registry with the built-in handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.constructors.insert(
            "accumulate".to_string(),
            Box::new(|| Box::new(AccumulateHandler::new())),
        );
        registry.constructors.insert(
            "overwrite".to_string(),
            Box::new(|| Box::new(OverwriteHandler::default())),
        );
        registry
    }

    /// Register a handler constructor under `name`.
    pub fn register(
        &mut self,
        name: &str,
        constructor: impl Fn() -> Box<dyn TableServerHandler> + Send + Sync + 'static,
    ) -> Result<()> {
        if self.constructors.contains_key(name) {
            return Err(Error::InvalidConfig(format!(
                "Handler {} is already registered",
                name
            )));
        }
        self.constructors
            .insert(name.to_string(), Box::new(constructor));
        Ok(())
    }

    /// Create an unconfigured handler instance.
    pub fn create(&self, name: &str) -> Result<Box<dyn TableServerHandler>> {
        self.constructors
            .get(name)
            .map(|construct| construct())
            .ok_or_else(|| Error::HandlerNotFound(name.to_string()))
    }

    /// Create the handler named by `config` and run its setup.
    pub fn create_configured(&self, config: &TableServerConfig) -> Result<Box<dyn TableServerHandler>> {
        let mut handler = self.create(&config.handler)?;
        handler.setup(config)?;
        Ok(handler)
    }

    /// Registered handler names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
