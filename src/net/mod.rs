//! Network layer.
//!
//! Provides the communication and scheduling core:
//! - Transport abstraction with an in-process mesh
//! - Outbound send tracking
//! - Per-key request queues (sync and async policies)
//! - Response table for replies and control messages
//! - The network engine running the receive/send and process loops

pub mod config;
pub mod engine;
pub mod message;
pub mod queue;
pub mod response;
pub mod sender;
pub mod transport;

pub use config::{EngineConfig, UpdateMode};
pub use engine::{EngineBuilder, EngineStats, NetworkEngine, Outbox};
pub use message::{
    EmptyMessage, GetRequest, GetResponse, ParamValue, PutRequest, PutResponse, Request,
    ShardAssignment, Tag, TaggedMessage,
};
pub use queue::{AsyncRequestQueue, RequestQueue, SyncRequestQueue};
pub use response::ResponseTable;
pub use sender::{SendStats, SendTracker};
pub use transport::{LocalCluster, LocalTransport, Transport};
