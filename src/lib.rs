//! # tablenet - Parameter Server Communication Core
//!
//! Messaging and request scheduling for a distributed parameter server:
//! - **net**: transport, network engine, per-key request queues, response table
//! - **server**: table server handlers bound to put/get/update requests
//! - **monitoring**: structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tablenet::core::Source;
//! use tablenet::net::{EngineConfig, GetRequest, GetResponse, LocalCluster, NetworkEngine, Tag, Transport};
//! use tablenet::server::{HandlerRegistry, TableServer, TableServerConfig};
//!
//! fn main() -> tablenet::Result<()> {
//!     let mut transports = LocalCluster::new(2).into_iter();
//!     let client: Arc<dyn Transport> = Arc::new(transports.next().unwrap());
//!     let shard: Arc<dyn Transport> = Arc::new(transports.next().unwrap());
//!
//!     let server = TableServer::from_registry(
//!         &HandlerRegistry::with_builtins(),
//!         &TableServerConfig::default(),
//!     )?;
//!     let _server_engine = server.start(NetworkEngine::builder(EngineConfig::sync()), shard)?;
//!     let engine = NetworkEngine::builder(EngineConfig::sync()).start(client)?;
//!
//!     engine.send(1, Tag::GET_REQUEST, &GetRequest { key: "w".into() })?;
//!     let (_, reply): (_, GetResponse) = engine.read(Source::Rank(1), Tag::GET_RESPONSE)?;
//!     println!("value: {:?}", reply.value);
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod monitoring;
pub mod net;
pub mod server;

pub use core::error::{Error, Result};
