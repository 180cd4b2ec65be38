//! Network engine.
//!
//! Runs two loops per process:
//! - the network loop probes the transport, routes each arriving message to
//!   the request queue, the response table or an immediate callback, and
//!   pushes outbound sends through the transport;
//! - the process loop pulls the next scheduled request from the request
//!   queue and invokes the handler bound to its tag.
//!
//! Handler invocations are serialized on the process loop. The network loop
//! never touches handler state.

use crate::core::{lock, Error, Rank, Result, Signal, Source};
use crate::net::config::EngineConfig;
use crate::net::message::{decode, encode, Request, Tag, TaggedMessage, MAX_TAGS};
use crate::net::queue::{create_request_queue, RequestQueue};
use crate::net::response::ResponseTable;
use crate::net::sender::{OutboundSend, SendStats, SendTracker};
use crate::net::transport::{Probe, Transport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Handler for a scheduled request, run on the process loop.
pub type RequestHandler = Box<dyn FnMut(Request, &Outbox) -> Result<()> + Send>;

/// Immediate callback for a received message, run on the network loop.
pub type MessageCallback = Box<dyn FnMut(&TaggedMessage, &Outbox) + Send>;

/// Engine counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub received: u64,
    pub enqueued: u64,
    pub buffered: u64,
    pub processed: u64,
    pub malformed: u64,
    /// Messages with a tag outside the known range
    pub unknown: u64,
    /// Requests with no handler bound for their tag
    pub unbound: u64,
    pub handler_errors: u64,
    pub sends: SendStats,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    enqueued: AtomicU64,
    buffered: AtomicU64,
    processed: AtomicU64,
    malformed: AtomicU64,
    unknown: AtomicU64,
    unbound: AtomicU64,
    handler_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// State shared by the engine, its loops and every [`Outbox`].
struct Shared {
    config: EngineConfig,
    rank: Rank,
    size: usize,
    transport: Option<Arc<dyn Transport>>,
    sends: SendTracker,
    responses: ResponseTable,
    queue: Arc<dyn RequestQueue>,
    running: AtomicBool,
    /// Wakes the network loop when sends are queued
    outbound: Signal,
    /// Wakes blocked readers when a response is buffered
    inbound: Signal,
    finalized: Once,
    fatal: Mutex<Option<String>>,
    counters: Counters,
}

impl Shared {
    fn is_active(&self) -> bool {
        self.transport.is_some()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn poll(&self) -> Duration {
        self.config.sleep_time()
    }

    /// Stop both loops without waiting for them.
    fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            debug!(rank = self.rank, "stopping network engine");
            self.queue.close();
            self.outbound.notify();
            self.inbound.notify();
        }
    }

    /// Record a fatal error and halt processing.
    fn fail(&self, err: Error) {
        error!(rank = self.rank, error = %err, "fatal engine error, halting");
        lock(&self.fatal).get_or_insert_with(|| err.to_string());
        self.stop();
    }

    fn finalize(&self) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        self.finalized.call_once(|| {
            if let Err(e) = transport.finalize() {
                warn!(rank = self.rank, error = %e, "transport finalize failed");
            } else {
                debug!(rank = self.rank, "transport finalized");
            }
        });
    }

    fn check_sendable(&self, dest: Rank) -> Result<()> {
        if !self.is_active() {
            return Err(Error::Inactive);
        }
        if !self.is_running() {
            return Err(Error::Stopped);
        }
        if dest >= self.size {
            return Err(Error::InvalidRank {
                rank: dest,
                size: self.size,
            });
        }
        Ok(())
    }

    /// Classify and route one received message.
    fn route(&self, msg: TaggedMessage, callbacks: &mut [Option<MessageCallback>], outbox: &Outbox) {
        let tag = msg.tag;
        let Some(index) = tag.index() else {
            warn!(rank = self.rank, tag = tag.0, source = msg.source, "unknown tag, message discarded");
            bump(&self.counters.unknown);
            return;
        };

        if tag == Tag::SHARD_ASSIGNMENT {
            info!(rank = self.rank, source = msg.source, "received shard assignment");
        } else if tag == Tag::WORKER_SHUTDOWN {
            info!(rank = self.rank, source = msg.source, "received worker shutdown");
        }

        let mut callback = callbacks.get_mut(index).and_then(Option::as_mut);
        if tag.is_control() {
            if let Some(cb) = callback.take() {
                cb(&msg, outbox);
            }
        }
        let kept = callback.is_some().then(|| msg.clone());

        if tag.is_request() {
            match self.queue.enqueue(msg) {
                Ok(()) => bump(&self.counters.enqueued),
                Err(e) if e.is_fatal() => {
                    self.fail(e);
                    return;
                }
                Err(e) => {
                    warn!(rank = self.rank, tag = %tag, error = %e, "request discarded");
                    bump(&self.counters.malformed);
                }
            }
        } else {
            let source = msg.source;
            match self.responses.push(tag, source, msg.data) {
                Ok(()) => {
                    bump(&self.counters.buffered);
                    self.inbound.notify();
                }
                Err(e) => {
                    warn!(rank = self.rank, tag = %tag, error = %e, "response discarded");
                    bump(&self.counters.unknown);
                }
            }
        }

        if let (Some(cb), Some(msg)) = (callback, kept) {
            cb(&msg, outbox);
        }
    }

    fn receive(&self, transport: &dyn Transport, probe: Probe) -> Option<TaggedMessage> {
        match transport.recv(&probe) {
            Ok(data) => {
                bump(&self.counters.received);
                trace!(rank = self.rank, source = probe.source, tag = %probe.tag, bytes = data.len(), "received");
                Some(TaggedMessage::new(probe.tag, probe.source, data))
            }
            Err(e) => {
                warn!(rank = self.rank, source = probe.source, tag = %probe.tag, error = %e, "receive failed");
                None
            }
        }
    }

    fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            received: c.received.load(Ordering::Relaxed),
            enqueued: c.enqueued.load(Ordering::Relaxed),
            buffered: c.buffered.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            unknown: c.unknown.load(Ordering::Relaxed),
            unbound: c.unbound.load(Ordering::Relaxed),
            handler_errors: c.handler_errors.load(Ordering::Relaxed),
            sends: self.sends.stats(),
        }
    }
}

fn network_loop(
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    mut callbacks: Vec<Option<MessageCallback>>,
) {
    let outbox = Outbox {
        shared: Arc::clone(&shared),
    };
    debug!(rank = shared.rank, "network loop started");

    while shared.is_running() {
        let seen = shared.outbound.generation();
        match transport.probe() {
            Ok(Some(probe)) => {
                if let Some(msg) = shared.receive(transport.as_ref(), probe) {
                    shared.route(msg, &mut callbacks, &outbox);
                }
            }
            Ok(None) => shared.outbound.wait(seen, shared.poll()),
            Err(e) => {
                warn!(rank = shared.rank, error = %e, "probe failed");
                shared.outbound.wait(seen, shared.poll());
            }
        }
        shared.sends.issue_pending(transport.as_ref());
        shared.sends.collect_active(transport.as_ref());
    }

    debug!(rank = shared.rank, "network loop stopped");
    shared.finalize();
}

fn process_loop(shared: Arc<Shared>, mut handlers: Vec<Option<RequestHandler>>) {
    let outbox = Outbox {
        shared: Arc::clone(&shared),
    };
    debug!(rank = shared.rank, "process loop started");

    while let Some(msg) = shared.queue.next_request() {
        if !shared.is_running() {
            break;
        }
        let handler = msg
            .tag
            .index()
            .and_then(|i| handlers.get_mut(i))
            .and_then(Option::as_mut);
        let Some(handler) = handler else {
            warn!(rank = shared.rank, tag = %msg.tag, "no handler bound, request discarded");
            bump(&shared.counters.unbound);
            continue;
        };
        let request = match Request::decode(&msg) {
            Ok(request) => request,
            Err(e) => {
                warn!(rank = shared.rank, tag = %msg.tag, error = %e, "malformed request discarded");
                bump(&shared.counters.malformed);
                continue;
            }
        };
        if let Err(e) = handler(request, &outbox) {
            warn!(rank = shared.rank, tag = %msg.tag, error = %e, "request handler failed");
            bump(&shared.counters.handler_errors);
        }
        bump(&shared.counters.processed);
    }

    debug!(rank = shared.rank, "process loop stopped");
}

/// Cloneable sending handle onto a running engine.
///
/// Handed to request handlers and message callbacks so they can reply.
#[derive(Clone)]
pub struct Outbox {
    shared: Arc<Shared>,
}

impl Outbox {
    pub fn rank(&self) -> Rank {
        self.shared.rank
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Queue an encoded record for `dest`. Returns without waiting for the
    /// transport; transmission happens on a later network loop iteration.
    pub fn send<T: Serialize>(&self, dest: Rank, tag: Tag, msg: &T) -> Result<()> {
        self.send_raw(dest, tag, encode(msg)?)
    }

    /// Queue an already encoded payload for `dest`.
    pub fn send_raw(&self, dest: Rank, tag: Tag, payload: Vec<u8>) -> Result<()> {
        self.shared.check_sendable(dest)?;
        self.shared.sends.push(OutboundSend::new(dest, tag, payload));
        self.shared.outbound.notify();
        Ok(())
    }

    /// Send to every rank except the last, which is reserved as coordinator.
    pub fn broadcast<T: Serialize>(&self, tag: Tag, msg: &T) -> Result<()> {
        let payload = encode(msg)?;
        for dest in 0..self.shared.size.saturating_sub(1) {
            self.send_raw(dest, tag, payload.clone())?;
        }
        Ok(())
    }

    /// Ask both loops to stop. Does not wait for them.
    pub fn stop(&self) {
        self.shared.stop();
    }
}

/// Collects request handlers and message callbacks before the loops start.
///
/// Bindings are frozen once the engine starts.
pub struct EngineBuilder {
    config: EngineConfig,
    handlers: Vec<Option<RequestHandler>>,
    callbacks: Vec<Option<MessageCallback>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            handlers: (0..MAX_TAGS).map(|_| None).collect(),
            callbacks: (0..MAX_TAGS).map(|_| None).collect(),
        }
    }

    /// Bind the handler for a request tag. At most one handler per tag.
    pub fn on_request(
        mut self,
        tag: Tag,
        handler: impl FnMut(Request, &Outbox) -> Result<()> + Send + 'static,
    ) -> Result<Self> {
        if !tag.is_request() {
            return Err(Error::InvalidConfig(format!("{} is not a request tag", tag)));
        }
        let slot = tag
            .index()
            .and_then(|i| self.handlers.get_mut(i))
            .ok_or(Error::UnknownTag(tag.0))?;
        if slot.is_some() {
            return Err(Error::InvalidConfig(format!("handler for {} already bound", tag)));
        }
        *slot = Some(Box::new(handler));
        Ok(self)
    }

    /// Bind an immediate callback for a tag. At most one callback per tag.
    pub fn on_message(
        mut self,
        tag: Tag,
        callback: impl FnMut(&TaggedMessage, &Outbox) + Send + 'static,
    ) -> Result<Self> {
        let slot = tag
            .index()
            .and_then(|i| self.callbacks.get_mut(i))
            .ok_or(Error::UnknownTag(tag.0))?;
        if slot.is_some() {
            return Err(Error::InvalidConfig(format!("callback for {} already bound", tag)));
        }
        *slot = Some(Box::new(callback));
        Ok(self)
    }

    fn shared(&self, transport: Option<Arc<dyn Transport>>) -> Arc<Shared> {
        let (rank, size) = transport
            .as_ref()
            .map(|t| (t.rank(), t.size()))
            .unwrap_or((0, 1));
        Arc::new(Shared {
            config: self.config.clone(),
            rank,
            size,
            running: AtomicBool::new(transport.is_some()),
            transport,
            sends: SendTracker::new(),
            responses: ResponseTable::new(size),
            queue: create_request_queue(&self.config),
            outbound: Signal::new(),
            inbound: Signal::new(),
            finalized: Once::new(),
            fatal: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    /// Build an engine with no transport and no loops.
    pub fn inert(self) -> NetworkEngine {
        let shared = self.shared(None);
        debug!("network engine constructed inert");
        NetworkEngine {
            shared,
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Start both loops on `transport`.
    pub fn start(self, transport: Arc<dyn Transport>) -> Result<NetworkEngine> {
        self.config.validate()?;
        let shared = self.shared(Some(Arc::clone(&transport)));
        let rank = shared.rank;

        let net = {
            let shared = Arc::clone(&shared);
            let callbacks = self.callbacks;
            std::thread::Builder::new()
                .name(format!("tablenet-net-{}", rank))
                .spawn(move || network_loop(shared, transport, callbacks))?
        };
        let process = {
            let shared = Arc::clone(&shared);
            let handlers = self.handlers;
            std::thread::Builder::new()
                .name(format!("tablenet-proc-{}", rank))
                .spawn(move || process_loop(shared, handlers))
        };
        let process = match process {
            Ok(handle) => handle,
            Err(e) => {
                shared.stop();
                let _ = net.join();
                return Err(e.into());
            }
        };

        info!(
            rank,
            size = shared.size,
            mode = %shared.config.update_mode,
            "network engine started"
        );
        Ok(NetworkEngine {
            shared,
            threads: Mutex::new(vec![net, process]),
        })
    }

    /// Start on a transport from `connect` if the activation variable is
    /// present in the environment, otherwise build an inert engine.
    pub fn start_from_env(
        self,
        connect: impl FnOnce() -> Result<Arc<dyn Transport>>,
    ) -> Result<NetworkEngine> {
        if std::env::var_os(&self.config.activation_env).is_none() {
            info!(
                var = %self.config.activation_env,
                "activation variable not set, network engine inert"
            );
            return Ok(self.inert());
        }
        let transport = connect()?;
        self.start(transport)
    }
}

/// Handle on the process-wide network engine.
///
/// Constructed once at process start and passed to collaborators by
/// reference. Dropping it shuts the engine down.
pub struct NetworkEngine {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Rank of this process. An inert engine reports rank 0.
    pub fn rank(&self) -> Rank {
        self.shared.rank
    }

    /// Group size. An inert engine reports 1.
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Whether the engine was started on a transport.
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Whether both loops are still running.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn outbox(&self) -> Outbox {
        Outbox {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Queue a record for `dest`; see [`Outbox::send`].
    pub fn send<T: Serialize>(&self, dest: Rank, tag: Tag, msg: &T) -> Result<()> {
        self.outbox().send(dest, tag, msg)
    }

    /// Queue an encoded payload for `dest`.
    pub fn send_raw(&self, dest: Rank, tag: Tag, payload: Vec<u8>) -> Result<()> {
        self.outbox().send_raw(dest, tag, payload)
    }

    /// Send to every non-coordinator rank.
    pub fn broadcast<T: Serialize>(&self, tag: Tag, msg: &T) -> Result<()> {
        self.outbox().broadcast(tag, msg)
    }

    /// Broadcast, then block until one `reply` from each non-coordinator
    /// rank has been read.
    pub fn sync_broadcast<T: Serialize>(&self, tag: Tag, reply: Tag, msg: &T) -> Result<()> {
        self.broadcast(tag, msg)?;
        self.wait_for_sync(reply, self.size().saturating_sub(1))
    }

    /// Block until `count` messages tagged `reply` have been read, from any
    /// source. Each message is consumed and counted exactly once.
    pub fn wait_for_sync(&self, reply: Tag, count: usize) -> Result<()> {
        for remaining in (0..count).rev() {
            let (source, _) = self.read_raw(Source::Any, reply)?;
            trace!(rank = self.rank(), source, remaining, "barrier reply");
        }
        Ok(())
    }

    /// Non-blocking read of the oldest raw payload matching `source` and `tag`.
    pub fn try_read_raw(&self, source: Source, tag: Tag) -> Result<Option<(Rank, Vec<u8>)>> {
        self.shared.responses.pop(source, tag)
    }

    /// Non-blocking read, decoded into `T`.
    pub fn try_read<T: DeserializeOwned>(
        &self,
        source: Source,
        tag: Tag,
    ) -> Result<Option<(Rank, T)>> {
        match self.try_read_raw(source, tag)? {
            Some((rank, data)) => Ok(Some((rank, decode(tag, &data)?))),
            None => Ok(None),
        }
    }

    /// Blocking read of a raw payload.
    ///
    /// Fails with [`Error::Stopped`] if the engine stops before a match
    /// arrives, and with [`Error::Inactive`] on an inert engine.
    pub fn read_raw(&self, source: Source, tag: Tag) -> Result<(Rank, Vec<u8>)> {
        if !self.is_active() {
            return Err(Error::Inactive);
        }
        loop {
            let seen = self.shared.inbound.generation();
            if let Some(found) = self.try_read_raw(source, tag)? {
                return Ok(found);
            }
            if !self.is_running() {
                return Err(Error::Stopped);
            }
            self.shared.inbound.wait(seen, self.shared.poll());
        }
    }

    /// Blocking read, decoded into `T`.
    pub fn read<T: DeserializeOwned>(&self, source: Source, tag: Tag) -> Result<(Rank, T)> {
        let (rank, data) = self.read_raw(source, tag)?;
        Ok((rank, decode(tag, &data)?))
    }

    /// Block until no pending or active sends remain.
    pub fn flush(&self) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        let shared = &self.shared;
        if shared.sends.wait_drained(shared.poll(), || shared.is_running()) {
            Ok(())
        } else {
            Err(Error::Stopped)
        }
    }

    /// Stop both loops and tear down the transport. Idempotent.
    pub fn shutdown(&self) {
        if self.is_active() && self.is_running() {
            info!(rank = self.rank(), "process is shutting down");
        }
        self.shared.stop();

        let current = std::thread::current().id();
        let handles: Vec<_> = lock(&self.threads).drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let name = handle.thread().name().map(str::to_string);
            if handle.join().is_err() {
                error!(thread = ?name, "engine thread panicked");
            }
        }
        self.shared.finalize();
    }

    /// The error that halted the engine, if any.
    pub fn fatal_error(&self) -> Option<String> {
        lock(&self.shared.fatal).clone()
    }

    /// Requests buffered in the request queue.
    pub fn pending_requests(&self) -> usize {
        self.shared.queue.pending()
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.stats()
    }
}

impl Drop for NetworkEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::{
        EmptyMessage, GetRequest, GetResponse, ParamValue, PutRequest, PutResponse,
        ShardAssignment,
    };
    use crate::net::transport::LocalCluster;
    use std::time::Instant;

    fn config() -> EngineConfig {
        EngineConfig::default().with_sleep_time(Duration::from_micros(200))
    }

    fn cluster(n: usize) -> Vec<Arc<dyn Transport>> {
        LocalCluster::new(n)
            .into_iter()
            .map(|t| Arc::new(t) as Arc<dyn Transport>)
            .collect()
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_inert_engine() {
        let mut cfg = config();
        cfg.activation_env = "TABLENET_TEST_ACTIVATION_NEVER_SET".to_string();
        let engine = NetworkEngine::builder(cfg)
            .start_from_env(|| panic!("must not connect"))
            .unwrap();

        assert!(!engine.is_active());
        assert!(!engine.is_running());
        assert_eq!(engine.rank(), 0);
        assert!(matches!(
            engine.send(0, Tag::EMPTY, &EmptyMessage),
            Err(Error::Inactive)
        ));
        assert!(matches!(engine.read_raw(Source::Any, Tag::EMPTY), Err(Error::Inactive)));
        assert!(engine.flush().is_ok());
        engine.shutdown();
        engine.shutdown();
    }

    #[test]
    fn test_request_reply_round_trip() {
        let mut transports = cluster(2);
        let server_transport = transports.pop().unwrap();
        let client_transport = transports.pop().unwrap();

        let server = NetworkEngine::builder(config())
            .on_request(Tag::GET_REQUEST, |request, outbox| {
                let reply = GetResponse {
                    key: request.key().to_string(),
                    value: Some(ParamValue::new(vec![4.0])),
                };
                outbox.send(request.source(), Tag::GET_RESPONSE, &reply)
            })
            .unwrap()
            .start(server_transport)
            .unwrap();
        let client = NetworkEngine::builder(config())
            .start(client_transport)
            .unwrap();

        client
            .send(
                1,
                Tag::GET_REQUEST,
                &GetRequest {
                    key: "emb".to_string(),
                },
            )
            .unwrap();
        client.flush().unwrap();

        let (source, reply): (Rank, GetResponse) = client.read(Source::Rank(1), Tag::GET_RESPONSE).unwrap();
        assert_eq!(source, 1);
        assert_eq!(reply.key, "emb");
        assert_eq!(reply.value.unwrap().data, vec![4.0]);

        wait_until(|| server.stats().processed == 1);
        server.shutdown();
        client.shutdown();
        assert!(!server.is_running());
    }

    #[test]
    fn test_responses_routed_to_table() {
        let mut transports = cluster(3);
        let receiver = NetworkEngine::builder(config())
            .start(transports.remove(0))
            .unwrap();
        let a = NetworkEngine::builder(config()).start(transports.remove(0)).unwrap();
        let b = NetworkEngine::builder(config()).start(transports.remove(0)).unwrap();

        b.send(0, Tag::PUT_RESPONSE, &EmptyMessage).unwrap();
        b.flush().unwrap();
        wait_until(|| receiver.stats().buffered == 1);
        a.send(0, Tag::PUT_RESPONSE, &EmptyMessage).unwrap();
        a.flush().unwrap();
        wait_until(|| receiver.stats().buffered == 2);

        // Wildcard reads scan ranks in ascending order.
        let first = receiver.try_read_raw(Source::Any, Tag::PUT_RESPONSE).unwrap();
        assert_eq!(first.map(|(r, _)| r), Some(1));
        let second = receiver.try_read_raw(Source::Any, Tag::PUT_RESPONSE).unwrap();
        assert_eq!(second.map(|(r, _)| r), Some(2));
        assert!(receiver
            .try_read_raw(Source::Any, Tag::PUT_RESPONSE)
            .unwrap()
            .is_none());
        assert_eq!(receiver.stats().enqueued, 0);
    }

    #[test]
    fn test_sync_broadcast_barrier() {
        let mut transports = cluster(3);
        let ack = |msg: &TaggedMessage, outbox: &Outbox| {
            outbox.send(msg.source, Tag::EMPTY, &EmptyMessage).unwrap();
        };
        let w0 = NetworkEngine::builder(config())
            .on_message(Tag::SHARD_ASSIGNMENT, ack)
            .unwrap()
            .start(transports.remove(0))
            .unwrap();
        let w1 = NetworkEngine::builder(config())
            .on_message(Tag::SHARD_ASSIGNMENT, ack)
            .unwrap()
            .start(transports.remove(0))
            .unwrap();
        let coordinator = NetworkEngine::builder(config())
            .start(transports.remove(0))
            .unwrap();
        assert_eq!(coordinator.rank(), 2);

        let assignment = ShardAssignment {
            table: 0,
            assignments: vec![(0, 0), (1, 1)],
        };
        coordinator
            .sync_broadcast(Tag::SHARD_ASSIGNMENT, Tag::EMPTY, &assignment)
            .unwrap();

        // Both acknowledgements were consumed by the barrier.
        assert!(coordinator.try_read_raw(Source::Any, Tag::EMPTY).unwrap().is_none());

        // The assignment itself stays readable on the workers.
        let (_, got): (Rank, ShardAssignment) = w0.read(Source::Rank(2), Tag::SHARD_ASSIGNMENT).unwrap();
        assert_eq!(got, assignment);
        let (_, got): (Rank, ShardAssignment) = w1.read(Source::Rank(2), Tag::SHARD_ASSIGNMENT).unwrap();
        assert_eq!(got, assignment);
    }

    #[test]
    fn test_capacity_violation_halts_engine() {
        let mut transports = cluster(2);
        let server_transport = transports.pop().unwrap();
        let client_transport = transports.pop().unwrap();

        let server = NetworkEngine::builder(EngineConfig::asynchronous(1).with_sleep_time(Duration::from_micros(200)))
            .on_request(Tag::PUT_REQUEST, |_, _| Ok(()))
            .unwrap()
            .start(server_transport)
            .unwrap();
        let client = NetworkEngine::builder(config()).start(client_transport).unwrap();

        // With one memory server and no gets arriving, the key is stuck in
        // the get phase after the first put, so the third put overflows.
        for i in 0..3 {
            let put = PutRequest {
                key: "k".to_string(),
                value: ParamValue::new(vec![i as f32]),
            };
            client.send(1, Tag::PUT_REQUEST, &put).unwrap();
        }
        client.flush().unwrap();

        wait_until(|| !server.is_running());
        let fatal = server.fatal_error().unwrap();
        assert!(fatal.contains("Capacity exceeded"));
        assert!(matches!(server.read_raw(Source::Rank(1), Tag::PUT_RESPONSE), Err(Error::Stopped)));
    }

    #[test]
    fn test_malformed_and_unknown_messages_dropped() {
        let mut transports = cluster(2);
        let server = NetworkEngine::builder(config())
            .start(transports.pop().unwrap())
            .unwrap();
        let client = NetworkEngine::builder(config())
            .start(transports.pop().unwrap())
            .unwrap();

        client.send_raw(1, Tag::PUT_REQUEST, vec![0xff, 0x00]).unwrap();
        client.send_raw(1, Tag(MAX_TAGS as i32 + 5), vec![1]).unwrap();
        client
            .send(1, Tag::GET_REQUEST, &GetRequest { key: "k".to_string() })
            .unwrap();
        client.flush().unwrap();

        // The get has no handler bound and is discarded on the process loop.
        wait_until(|| {
            let stats = server.stats();
            stats.malformed == 1 && stats.unknown == 1 && stats.unbound == 1
        });
        assert!(server.is_running());
        assert!(server.fatal_error().is_none());
    }

    #[test]
    fn test_read_from_out_of_range_rank() {
        let mut transports = cluster(2);
        let engine = NetworkEngine::builder(config())
            .start(transports.remove(0))
            .unwrap();

        assert!(matches!(
            engine.read_raw(Source::Rank(2), Tag::EMPTY),
            Err(Error::InvalidRank { rank: 2, size: 2 })
        ));
        assert!(matches!(
            engine.try_read_raw(Source::Rank(7), Tag::EMPTY),
            Err(Error::InvalidRank { rank: 7, size: 2 })
        ));
        assert!(engine.try_read_raw(Source::Rank(1), Tag::EMPTY).unwrap().is_none());
    }

    #[test]
    fn test_sends_during_flush_are_delivered() {
        const TOTAL: usize = 500;
        let mut transports = cluster(2);
        let client = NetworkEngine::builder(config())
            .start(transports.remove(0))
            .unwrap();
        let receiver = NetworkEngine::builder(config())
            .start(transports.remove(0))
            .unwrap();
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..TOTAL {
                    let reply = PutResponse {
                        key: i.to_string(),
                        accepted: true,
                    };
                    client.send(1, Tag::PUT_RESPONSE, &reply).unwrap();
                }
                done.store(true, Ordering::Release);
            });
            scope.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    client.flush().unwrap();
                }
                client.flush().unwrap();
            });
        });

        let sends = client.stats().sends;
        assert_eq!(sends.queued, TOTAL as u64);
        assert_eq!(sends.completed, sends.queued);

        for i in 0..TOTAL {
            let (source, reply): (Rank, PutResponse) =
                receiver.read(Source::Rank(0), Tag::PUT_RESPONSE).unwrap();
            assert_eq!(source, 0);
            assert_eq!(reply.key, i.to_string());
        }
        assert!(receiver
            .try_read_raw(Source::Any, Tag::PUT_RESPONSE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_callback_runs_after_routing() {
        let mut transports = cluster(2);
        let (tx, rx) = std::sync::mpsc::channel();
        let server = NetworkEngine::builder(config())
            .on_message(Tag::PUT_RESPONSE, move |msg, _| {
                tx.send(msg.source).unwrap();
            })
            .unwrap()
            .start(transports.pop().unwrap())
            .unwrap();
        let client = NetworkEngine::builder(config())
            .start(transports.pop().unwrap())
            .unwrap();

        client.send(1, Tag::PUT_RESPONSE, &EmptyMessage).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        // The message was still buffered for readers.
        let (source, _) = server.read_raw(Source::Rank(0), Tag::PUT_RESPONSE).unwrap();
        assert_eq!(source, 0);
    }

    #[test]
    fn test_duplicate_bindings_rejected() {
        let builder = NetworkEngine::builder(config())
            .on_request(Tag::PUT_REQUEST, |_, _| Ok(()))
            .unwrap();
        assert!(builder.on_request(Tag::PUT_REQUEST, |_, _| Ok(())).is_err());

        let builder = NetworkEngine::builder(config());
        assert!(builder.on_request(Tag::GET_RESPONSE, |_, _| Ok(())).is_err());
    }

    #[test]
    fn test_shutdown_is_idempotent_and_stops_sends() {
        let mut transports = cluster(1);
        let engine = NetworkEngine::builder(config())
            .start(transports.pop().unwrap())
            .unwrap();
        assert!(engine.is_running());

        engine.shutdown();
        engine.shutdown();
        assert!(!engine.is_running());
        assert!(matches!(
            engine.send(0, Tag::EMPTY, &EmptyMessage),
            Err(Error::Stopped)
        ));
        assert!(engine.flush().is_ok());
    }

    #[test]
    fn test_worker_shutdown_callback_stops_engine() {
        let mut transports = cluster(2);
        let worker = NetworkEngine::builder(config())
            .on_message(Tag::WORKER_SHUTDOWN, |_, outbox| outbox.stop())
            .unwrap()
            .start(transports.remove(0))
            .unwrap();
        let coordinator = NetworkEngine::builder(config())
            .start(transports.remove(0))
            .unwrap();

        coordinator.send(0, Tag::WORKER_SHUTDOWN, &EmptyMessage).unwrap();
        wait_until(|| !worker.is_running());
        worker.shutdown();
    }
}
