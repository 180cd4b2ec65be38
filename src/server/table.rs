//! Parameter table server.
//!
//! Owns one shard of the key/value table and serves it through a
//! [`TableServerHandler`]. The handler is bound to the put, get and update
//! request tags of a [`NetworkEngine`]; all three run on the engine's
//! process loop, so the shard is only ever touched by one request at a time.

use crate::core::{lock, Rank, Result};
use crate::net::{
    EngineBuilder, GetResponse, NetworkEngine, Outbox, ParamValue, PutRequest, PutResponse,
    Request, Tag, Transport,
};
use crate::server::config::TableServerConfig;
use crate::server::handler::TableServerHandler;
use crate::server::registry::HandlerRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Table server statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub puts: u64,
    pub gets: u64,
    pub updates: u64,
    /// Requests the handler declined
    pub rejected: u64,
    pub checkpoints_due: u64,
    pub keys: usize,
}

struct TableState {
    handler: Box<dyn TableServerHandler>,
    table: HashMap<String, ParamValue>,
    stats: TableStats,
}

impl TableState {
    fn handle(&mut self, request: Request, outbox: &Outbox) -> Result<()> {
        match request {
            Request::Put { source, body } => {
                self.stats.puts += 1;
                let accepted = self.put(&body);
                self.reply_put(outbox, source, body.key, accepted)
            }
            Request::Update { source, body } => {
                self.stats.updates += 1;
                let accepted = match self.table.get_mut(&body.key) {
                    Some(stored) => self.handler.update(stored, &body.value),
                    None => false,
                };
                if accepted {
                    self.check_checkpoint(&body.key);
                }
                self.reply_put(outbox, source, body.key, accepted)
            }
            Request::Get { source, body } => {
                self.stats.gets += 1;
                let value = match self.table.get(&body.key) {
                    Some(stored) => {
                        let mut out = ParamValue::default();
                        if self.handler.get(&body.key, stored, &mut out) {
                            Some(out)
                        } else {
                            self.stats.rejected += 1;
                            None
                        }
                    }
                    None => None,
                };
                let reply = GetResponse {
                    key: body.key,
                    value,
                };
                outbox.send(source, Tag::GET_RESPONSE, &reply)
            }
        }
    }

    /// First put for a key initialises it; later puts merge as updates.
    fn put(&mut self, body: &PutRequest) -> bool {
        let accepted = match self.table.get_mut(&body.key) {
            Some(stored) => self.handler.update(stored, &body.value),
            None => {
                let mut target = ParamValue::default();
                let ok = self.handler.put(&body.key, &mut target, &body.value);
                if ok {
                    self.table.insert(body.key.clone(), target);
                    self.stats.keys = self.table.len();
                }
                ok
            }
        };
        if accepted {
            self.check_checkpoint(&body.key);
        }
        accepted
    }

    fn check_checkpoint(&mut self, key: &str) {
        if let Some(value) = self.table.get(key) {
            if self.handler.checkpoint_now(key, value) {
                self.stats.checkpoints_due += 1;
                info!(key, version = value.version, "checkpoint due");
            }
        }
    }

    fn reply_put(&mut self, outbox: &Outbox, source: Rank, key: String, accepted: bool) -> Result<()> {
        if !accepted {
            self.stats.rejected += 1;
            debug!(key = %key, source, handler = self.handler.name(), "request declined");
        }
        outbox.send(source, Tag::PUT_RESPONSE, &PutResponse { key, accepted })
    }
}

/// Server for one shard of the parameter table.
#[derive(Clone)]
pub struct TableServer {
    state: Arc<Mutex<TableState>>,
}

impl TableServer {
    /// Wrap a handler, running its setup against `config`.
    pub fn new(mut handler: Box<dyn TableServerHandler>, config: &TableServerConfig) -> Result<Self> {
        config.validate()?;
        handler.setup(config)?;
        Ok(Self::from_handler(handler))
    }

    /// Create the handler named in `config` from `registry`.
    pub fn from_registry(registry: &HandlerRegistry, config: &TableServerConfig) -> Result<Self> {
        config.validate()?;
        let handler = registry.create_configured(config)?;
        Ok(Self::from_handler(handler))
    }

    fn from_handler(handler: Box<dyn TableServerHandler>) -> Self {
        info!(handler = handler.name(), "table server created");
        Self {
            state: Arc::new(Mutex::new(TableState {
                handler,
                table: HashMap::new(),
                stats: TableStats::default(),
            })),
        }
    }

    /// Bind the handler to the put, get and update request tags.
    pub fn bind(&self, builder: EngineBuilder) -> Result<EngineBuilder> {
        let mut builder = builder;
        for tag in [Tag::PUT_REQUEST, Tag::GET_REQUEST, Tag::UPDATE_REQUEST] {
            let state = Arc::clone(&self.state);
            builder = builder.on_request(tag, move |request, outbox| {
                lock(&state).handle(request, outbox)
            })?;
        }
        Ok(builder)
    }

    /// Bind and start the engine on `transport`.
    pub fn start(&self, builder: EngineBuilder, transport: Arc<dyn Transport>) -> Result<NetworkEngine> {
        self.bind(builder)?.start(transport)
    }

    /// Stored value for `key`.
    pub fn value(&self, key: &str) -> Option<ParamValue> {
        lock(&self.state).table.get(key).cloned()
    }

    /// Number of keys held by this shard.
    pub fn len(&self) -> usize {
        lock(&self.state).table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TableStats {
        lock(&self.state).stats.clone()
    }
}
