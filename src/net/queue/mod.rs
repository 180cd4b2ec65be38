//! Request queues.
//!
//! Incoming put/get requests are buffered per parameter key and handed to
//! the process loop according to one of two scheduling policies:
//! - [`SyncRequestQueue`]: one FIFO per key, round-robin across keys
//! - [`AsyncRequestQueue`]: put and get sub-queues per key, served in
//!   phases of at most `num_memory_servers` requests

pub mod async_queue;
pub mod sync_queue;

pub use async_queue::AsyncRequestQueue;
pub use sync_queue::SyncRequestQueue;

use crate::core::{lock, Result, Signal};
use crate::net::config::{EngineConfig, UpdateMode};
use crate::net::message::TaggedMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Scheduling queue between the network loop and the process loop.
///
/// `enqueue` is called by the network loop only and `next_request` by the
/// process loop only.
pub trait RequestQueue: Send + Sync {
    /// Buffer a request under its routing key.
    fn enqueue(&self, msg: TaggedMessage) -> Result<()>;

    /// Block until the policy yields a request. Returns `None` once closed.
    fn next_request(&self) -> Option<TaggedMessage>;

    /// Scan every known key once without blocking.
    fn try_next(&self) -> Option<TaggedMessage>;

    /// Wake and release a blocked `next_request`.
    fn close(&self);

    /// Number of distinct keys seen so far.
    fn key_count(&self) -> usize;

    /// Number of buffered requests across all keys.
    fn pending(&self) -> usize;
}

/// Create the queue selected by the engine configuration.
pub fn create_request_queue(config: &EngineConfig) -> Arc<dyn RequestQueue> {
    match config.update_mode {
        UpdateMode::Sync => Arc::new(SyncRequestQueue::new(config.sleep_time())),
        UpdateMode::Async => Arc::new(
            AsyncRequestQueue::new(config.num_memory_servers, config.sleep_time())
                .with_first_put_flip(config.first_put_flips_phase),
        ),
    }
}

#[derive(Debug)]
struct SlotIndex<S> {
    keys: HashMap<String, usize>,
    slots: Vec<Arc<Mutex<S>>>,
}

/// Per-key slots visited by a round-robin cursor.
///
/// The index lock is only held to find or create a slot; operating on a slot
/// takes that slot's own lock, so producers on different keys never contend.
#[derive(Debug)]
pub(crate) struct RoundRobin<S> {
    index: RwLock<SlotIndex<S>>,
    cursor: Mutex<usize>,
    ready: Signal,
    closed: AtomicBool,
    pending: AtomicUsize,
    poll: Duration,
}

impl<S> RoundRobin<S> {
    pub(crate) fn new(poll: Duration) -> Self {
        Self {
            index: RwLock::new(SlotIndex {
                keys: HashMap::new(),
                slots: Vec::new(),
            }),
            cursor: Mutex::new(0),
            ready: Signal::new(),
            closed: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            poll,
        }
    }

    /// Slot for `key`, created with `create` on first sighting.
    fn slot(&self, key: &str, create: impl FnOnce() -> S) -> (usize, Arc<Mutex<S>>) {
        {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(&i) = index.keys.get(key) {
                return (i, Arc::clone(&index.slots[i]));
            }
        }
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(&i) = index.keys.get(key) {
            return (i, Arc::clone(&index.slots[i]));
        }
        let slot = Arc::new(Mutex::new(create()));
        index.slots.push(Arc::clone(&slot));
        let i = index.slots.len() - 1;
        index.keys.insert(key.to_string(), i);
        (i, slot)
    }

    fn slot_at(&self, i: usize) -> Option<Arc<Mutex<S>>> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.slots.get(i).map(Arc::clone)
    }

    /// Insert into the slot for `key` and wake the consumer.
    pub(crate) fn push(
        &self,
        key: &str,
        create: impl FnOnce() -> S,
        insert: impl FnOnce(usize, &mut S) -> Result<()>,
    ) -> Result<()> {
        let (i, slot) = self.slot(key, create);
        {
            let mut slot = lock(&slot);
            insert(i, &mut *slot)?;
            // Counted before the slot lock is released, so a concurrent
            // take can never decrement first.
            self.pending.fetch_add(1, Ordering::AcqRel);
        }
        self.ready.notify();
        Ok(())
    }

    /// Visit each known slot at most once starting at the cursor.
    ///
    /// The cursor advances past every visited slot, whether or not it
    /// yielded a request.
    pub(crate) fn scan(
        &self,
        mut take: impl FnMut(&mut S) -> Option<TaggedMessage>,
    ) -> Option<TaggedMessage> {
        let len = self.key_count();
        if len == 0 {
            return None;
        }
        let mut cursor = lock(&self.cursor);
        for _ in 0..len {
            let i = *cursor % len;
            *cursor = (i + 1) % len;
            let Some(slot) = self.slot_at(i) else {
                continue;
            };
            let mut slot = lock(&slot);
            if let Some(msg) = take(&mut *slot) {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                return Some(msg);
            }
        }
        None
    }

    /// Scan repeatedly, parking for the poll interval after each full
    /// unsuccessful cycle, until a request is found or the queue closes.
    pub(crate) fn next(
        &self,
        mut take: impl FnMut(&mut S) -> Option<TaggedMessage>,
    ) -> Option<TaggedMessage> {
        loop {
            if self.is_closed() {
                return None;
            }
            let seen = self.ready.generation();
            if let Some(msg) = self.scan(&mut take) {
                return Some(msg);
            }
            self.ready.wait(seen, self.poll);
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn key_count(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .len()
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}
