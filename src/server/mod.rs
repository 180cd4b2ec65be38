//! Table server.
//!
//! Serves one shard of the parameter table:
//! - Handler contract and built-in merge policies
//! - Handler registry keyed by name
//! - Table server binding handlers to the network engine

pub mod config;
pub mod handler;
pub mod registry;
pub mod table;

pub use config::TableServerConfig;
pub use handler::{AccumulateHandler, CheckpointPolicy, OverwriteHandler, TableServerHandler};
pub use registry::{HandlerConstructor, HandlerRegistry};
pub use table::{TableServer, TableStats};
