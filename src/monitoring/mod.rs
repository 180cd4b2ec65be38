//! Monitoring Module
//!
//! Structured logging setup for processes embedding tablenet.

pub mod logging;

pub use logging::{init_logging, LogFormat, LogLevel, LoggerConfig};
